//! State machine abstraction
//!
//! The state machine is the application logic the cluster coordinates.
//! Committed entries are applied to it in index order; implementations
//! must be deterministic so every replica converges on the same state.

use std::sync::{Arc, Mutex};

pub mod kv;

/// Result of applying a command: output on success, a message on
/// command-level failure (the entry is still consumed).
pub type ApplyResult = Result<String, String>;

/// Application logic driven by the replicated log.
pub trait StateMachine: Send {
    /// Cheap leader-side sanity check before a command is proposed.
    fn validate(&self, command: &[u8]) -> Result<(), String>;

    /// Apply a committed command. Empty commands are leader no-ops and
    /// must be accepted without effect.
    fn apply(&mut self, command: &[u8]) -> ApplyResult;
}

/// A state machine that supports log compaction.
pub trait Snapshotable: StateMachine {
    /// Serialize the current state.
    fn snapshot(&self) -> Result<Vec<u8>, String>;

    /// Replace the current state with a serialized snapshot.
    fn restore(&mut self, data: &[u8]) -> Result<(), String>;
}

/// Shared record of applied commands for assertions in tests.
pub type AppliedCommands = Arc<Mutex<Vec<Vec<u8>>>>;

/// Test state machine that records every applied command.
pub struct TestStateMachine {
    applied: AppliedCommands,
}

impl TestStateMachine {
    pub fn new() -> Self {
        TestStateMachine { applied: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Create with a shared vec so the test body can inspect what got
    /// applied.
    pub fn new_shared(applied: AppliedCommands) -> Self {
        TestStateMachine { applied }
    }
}

impl Default for TestStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine for TestStateMachine {
    fn validate(&self, _command: &[u8]) -> Result<(), String> {
        Ok(())
    }

    fn apply(&mut self, command: &[u8]) -> ApplyResult {
        self.applied.lock().unwrap().push(command.to_vec());
        Ok(String::new())
    }
}

impl Snapshotable for TestStateMachine {
    fn snapshot(&self) -> Result<Vec<u8>, String> {
        let applied = self.applied.lock().unwrap().clone();
        serde_json::to_vec(&applied).map_err(|e| format!("test state machine snapshot failed: {}", e))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        let applied: Vec<Vec<u8>> = serde_json::from_slice(data)
            .map_err(|e| format!("test state machine restore failed: {}", e))?;
        *self.applied.lock().unwrap() = applied;
        Ok(())
    }
}
