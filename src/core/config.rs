//! Construction configuration for the consensus core

use thiserror::Error;

/// Errors detected while validating a [`RaftConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("node id must be non-zero")]
    InvalidId,
    #[error("peer id must be non-zero and distinct from the local id")]
    InvalidPeer,
    #[error("duplicate peer id {0}")]
    DuplicatePeer(u64),
    #[error("heartbeat_tick must be at least 1")]
    InvalidHeartbeatTick,
    #[error("election_tick must be greater than heartbeat_tick")]
    InvalidElectionTick,
}

/// Configuration for a single consensus core.
///
/// All deadlines are expressed in ticks; the host decides how much wall
/// clock one tick is worth.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Local node ID (non-zero)
    pub id: u64,
    /// Remote peer IDs, excluding the local node
    pub peers: Vec<u64>,
    /// Base election timeout in ticks; the effective timeout is
    /// resampled from `[election_tick, 2 * election_tick)`
    pub election_tick: usize,
    /// Heartbeat period in ticks
    pub heartbeat_tick: usize,
    /// Soft cap on the payload bytes of one AppendEntries message
    pub max_size_per_msg: u64,
    /// Run the PreVote phase before real elections
    pub pre_vote: bool,
    /// Randomize the election timeout. Disable for deterministic
    /// simulation: the timeout becomes a fixed per-node stagger instead.
    pub randomize_timeout: bool,
}

impl RaftConfig {
    /// A config for node `id` in the cluster `peers` (self excluded),
    /// with default timing.
    pub fn new(id: u64, peers: Vec<u64>) -> Self {
        RaftConfig {
            id,
            peers,
            election_tick: 10,
            heartbeat_tick: 3,
            max_size_per_msg: 1 << 20,
            pre_vote: true,
            randomize_timeout: true,
        }
    }

    pub fn with_election_tick(mut self, ticks: usize) -> Self {
        self.election_tick = ticks;
        self
    }

    pub fn with_heartbeat_tick(mut self, ticks: usize) -> Self {
        self.heartbeat_tick = ticks;
        self
    }

    pub fn with_max_size_per_msg(mut self, bytes: u64) -> Self {
        self.max_size_per_msg = bytes;
        self
    }

    pub fn with_pre_vote(mut self, enabled: bool) -> Self {
        self.pre_vote = enabled;
        self
    }

    pub fn with_randomize_timeout(mut self, enabled: bool) -> Self {
        self.randomize_timeout = enabled;
        self
    }

    /// Check the invariants the core relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id == 0 {
            return Err(ConfigError::InvalidId);
        }
        if self.heartbeat_tick == 0 {
            return Err(ConfigError::InvalidHeartbeatTick);
        }
        if self.election_tick <= self.heartbeat_tick {
            return Err(ConfigError::InvalidElectionTick);
        }
        let mut seen = std::collections::HashSet::new();
        for &peer in &self.peers {
            if peer == 0 || peer == self.id {
                return Err(ConfigError::InvalidPeer);
            }
            if !seen.insert(peer) {
                return Err(ConfigError::DuplicatePeer(peer));
            }
        }
        Ok(())
    }
}
