//! Per-peer replication progress
//!
//! The leader keeps one [`Peer`] per remote node. The record paces what
//! gets sent: `Probe` while searching for the match point (at most one
//! unanswered append in flight), `Replicate` once the logs agree
//! (optimistic `next` advancement), `Snapshot` while a snapshot
//! transfer is pending. Mixing the streams would waste bandwidth and
//! can reorder a follower's view, so each state gates the others.

use super::message::Entry;

/// Replication mode toward one follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Searching for the match point; one append at a time
    Probe,
    /// Streaming entries with optimistic `next`
    Replicate,
    /// Snapshot in flight; replication suspended
    Snapshot,
}

/// Outcome of a vote or pre-vote exchange with one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteState {
    /// No response yet this round
    Pending,
    Granted,
    Rejected,
}

/// Replication cursor and vote tally for one remote node.
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: u64,
    /// Highest log index known replicated on the peer
    pub matched: u64,
    /// Next index to send
    pub next: u64,
    pub state: PeerState,
    /// Probe-only: an append is outstanding, hold further sends
    paused: bool,
    /// Index of the in-flight snapshot, 0 when none
    pub pending_snapshot: u64,
    pub vote: VoteState,
}

impl Peer {
    pub fn new(id: u64) -> Self {
        Peer {
            id,
            matched: 0,
            next: 1,
            state: PeerState::Probe,
            paused: false,
            pending_snapshot: 0,
            vote: VoteState::Pending,
        }
    }

    /// Reinitialize the replication cursor when this node becomes
    /// leader.
    pub fn reset(&mut self, last_index: u64) {
        self.matched = 0;
        self.next = last_index + 1;
        self.state = PeerState::Probe;
        self.paused = false;
        self.pending_snapshot = 0;
    }

    /// Record that an append carrying `entries` was handed to the
    /// transport.
    pub fn send_entries(&mut self, entries: &[Entry]) {
        match self.state {
            PeerState::Probe => {
                // Hold further appends until the probe is answered.
                if !entries.is_empty() {
                    self.paused = true;
                }
            }
            PeerState::Replicate => {
                if let Some(last) = entries.last() {
                    self.next = self.next.max(last.index + 1);
                }
            }
            PeerState::Snapshot => panic!("append sent to peer {} during snapshot", self.id),
        }
    }

    /// Record that a snapshot covering up to `index` was handed to the
    /// transport.
    pub fn send_snapshot(&mut self, index: u64) {
        self.state = PeerState::Snapshot;
        self.pending_snapshot = index;
    }

    /// Digest an `AppendResponse`. `index` echoes the probed position,
    /// `hint` carries the peer's match point on accept and the back-off
    /// hint on reject. Returns true when the accept advanced our view
    /// of the peer.
    pub fn handle_append_response(&mut self, reject: bool, _index: u64, hint: u64) -> bool {
        if reject {
            // Back off toward the match point, at least one step, never
            // below 1.
            self.next = 1.max((hint + 1).min(self.next.saturating_sub(1)));
            self.state = PeerState::Probe;
            self.paused = false;
            return false;
        }
        self.matched = self.matched.max(hint);
        self.next = self.matched + 1;
        self.state = PeerState::Replicate;
        self.paused = false;
        true
    }

    /// Digest a `SnapshotResponse`. Either way the transfer is over and
    /// we fall back to probing from the reported position.
    pub fn handle_snapshot_response(&mut self, reject: bool, hint: u64) {
        if reject {
            self.next = hint + 1;
        } else {
            self.matched = self.matched.max(self.pending_snapshot);
            self.next = self.matched + 1;
        }
        self.pending_snapshot = 0;
        self.state = PeerState::Probe;
        self.paused = false;
    }

    /// The host reported a failed send. Optimistic replication state is
    /// no longer trustworthy; drop back to probing and wait for the
    /// next resume signal.
    pub fn handle_unreachable(&mut self) {
        if self.state == PeerState::Replicate {
            self.next = self.matched + 1;
            self.state = PeerState::Probe;
        }
        self.paused = true;
    }

    /// Clear the probe hold (e.g. the peer answered a heartbeat, so it
    /// is reachable again).
    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Whether the leader should skip this peer when broadcasting
    /// appends.
    pub fn is_paused(&self) -> bool {
        match self.state {
            PeerState::Probe => self.paused,
            PeerState::Replicate => false,
            PeerState::Snapshot => true,
        }
    }

    pub fn update_vote(&mut self, rejected: bool) {
        self.vote = if rejected { VoteState::Rejected } else { VoteState::Granted };
    }

    pub fn reset_vote(&mut self) {
        self.vote = VoteState::Pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> Entry {
        Entry { index, term, data: vec![] }
    }

    #[test]
    fn test_new_peer_probes_from_one() {
        let peer = Peer::new(2);
        assert_eq!(peer.matched, 0);
        assert_eq!(peer.next, 1);
        assert_eq!(peer.state, PeerState::Probe);
        assert!(!peer.is_paused());
    }

    #[test]
    fn test_probe_send_pauses_until_response() {
        let mut peer = Peer::new(2);
        peer.send_entries(&[entry(1, 1)]);
        assert!(peer.is_paused());

        let advanced = peer.handle_append_response(false, 0, 1);
        assert!(advanced);
        assert_eq!(peer.matched, 1);
        assert_eq!(peer.next, 2);
        assert_eq!(peer.state, PeerState::Replicate);
        assert!(!peer.is_paused());
    }

    #[test]
    fn test_empty_probe_does_not_pause() {
        let mut peer = Peer::new(2);
        peer.send_entries(&[]);
        assert!(!peer.is_paused());
    }

    #[test]
    fn test_replicate_advances_next_optimistically() {
        let mut peer = Peer::new(2);
        peer.handle_append_response(false, 0, 3);
        assert_eq!(peer.state, PeerState::Replicate);

        peer.send_entries(&[entry(4, 1), entry(5, 1)]);
        assert_eq!(peer.next, 6);
        assert!(!peer.is_paused());
    }

    #[test]
    fn test_reject_backs_off_toward_hint() {
        let mut peer = Peer::new(2);
        peer.reset(10); // next = 11
        let advanced = peer.handle_append_response(true, 10, 4);
        assert!(!advanced);
        assert_eq!(peer.next, 5);
        assert_eq!(peer.state, PeerState::Probe);
    }

    #[test]
    fn test_reject_always_moves_at_least_one_step() {
        let mut peer = Peer::new(2);
        peer.reset(3); // next = 4
        // A hint that does not help still lowers next by one.
        peer.handle_append_response(true, 3, 9);
        assert_eq!(peer.next, 3);
    }

    #[test]
    fn test_reject_never_below_one() {
        let mut peer = Peer::new(2);
        assert_eq!(peer.next, 1);
        peer.handle_append_response(true, 0, 0);
        assert_eq!(peer.next, 1);
    }

    #[test]
    fn test_snapshot_pauses_then_resumes_probe() {
        let mut peer = Peer::new(2);
        peer.send_snapshot(7);
        assert_eq!(peer.state, PeerState::Snapshot);
        assert_eq!(peer.pending_snapshot, 7);
        assert!(peer.is_paused());

        peer.handle_snapshot_response(false, 0);
        assert_eq!(peer.matched, 7);
        assert_eq!(peer.next, 8);
        assert_eq!(peer.pending_snapshot, 0);
        assert_eq!(peer.state, PeerState::Probe);
        assert!(!peer.is_paused());
    }

    #[test]
    fn test_snapshot_reject_resumes_from_hint() {
        let mut peer = Peer::new(2);
        peer.send_snapshot(7);
        peer.handle_snapshot_response(true, 12);
        assert_eq!(peer.next, 13);
        assert_eq!(peer.matched, 0);
        assert_eq!(peer.state, PeerState::Probe);
    }

    #[test]
    fn test_unreachable_reverts_replicate_to_probe() {
        let mut peer = Peer::new(2);
        peer.handle_append_response(false, 0, 5);
        peer.send_entries(&[entry(6, 1)]);
        assert_eq!(peer.next, 7);

        peer.handle_unreachable();
        assert_eq!(peer.state, PeerState::Probe);
        assert_eq!(peer.next, 6);
        assert!(peer.is_paused());

        peer.resume();
        assert!(!peer.is_paused());
    }

    #[test]
    fn test_vote_state_transitions() {
        let mut peer = Peer::new(2);
        assert_eq!(peer.vote, VoteState::Pending);
        peer.update_vote(false);
        assert_eq!(peer.vote, VoteState::Granted);
        peer.update_vote(true);
        assert_eq!(peer.vote, VoteState::Rejected);
        peer.reset_vote();
        assert_eq!(peer.vote, VoteState::Pending);
    }
}
