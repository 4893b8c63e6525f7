//! Outstanding read-index requests awaiting heartbeat quorum
//!
//! A leader answers a linearizable read by remembering its commit index,
//! broadcasting a heartbeat tagged with the request's context, and
//! releasing the read once a quorum echoes the tag. Requests are kept
//! in arrival order so a quorum on a newer request also releases every
//! older one.

use std::collections::{HashMap, HashSet, VecDeque};

/// One read-index request waiting for quorum confirmation.
#[derive(Debug, Clone)]
pub struct ReadIndexStatus {
    /// Leader commit index at the moment the request was accepted
    pub index: u64,
    /// Node that asked (the leader itself for local reads)
    pub from: u64,
    /// Caller-supplied context, unique per outstanding request
    pub context: Vec<u8>,
    /// Peers that echoed the context back
    acks: HashSet<u64>,
}

/// Tracker for all in-flight read-index requests, ordered by arrival.
#[derive(Debug, Default)]
pub struct ReadOnly {
    pending: HashMap<Vec<u8>, ReadIndexStatus>,
    queue: VecDeque<Vec<u8>>,
}

impl ReadOnly {
    pub fn new() -> Self {
        ReadOnly::default()
    }

    /// Register a request. A duplicate context refreshes the requester
    /// and restarts its ack count but keeps its place in the queue.
    pub fn add_request(&mut self, index: u64, from: u64, context: Vec<u8>) {
        if let Some(status) = self.pending.get_mut(&context) {
            status.from = from;
            status.acks.clear();
            return;
        }
        self.queue.push_back(context.clone());
        self.pending.insert(
            context.clone(),
            ReadIndexStatus { index, from, context, acks: HashSet::new() },
        );
    }

    /// Count a heartbeat response for `context`. Returns the number of
    /// peers that have acked so far (the leader is not in the set).
    /// Unknown contexts (stale or plain heartbeats) count as zero.
    pub fn receive_ack(&mut self, peer: u64, context: &[u8]) -> usize {
        match self.pending.get_mut(context) {
            Some(status) => {
                status.acks.insert(peer);
                status.acks.len()
            }
            None => 0,
        }
    }

    /// Release every request up to and including `context`, in arrival
    /// order. Unknown contexts release nothing.
    pub fn advance(&mut self, context: &[u8]) -> Vec<ReadIndexStatus> {
        if !self.pending.contains_key(context) {
            return Vec::new();
        }
        let mut released = Vec::new();
        while let Some(ctx) = self.queue.pop_front() {
            let status = self.pending.remove(&ctx).expect("queue and pending out of sync");
            let done = status.context == context;
            released.push(status);
            if done {
                break;
            }
        }
        released
    }

    /// Drop all outstanding requests (role change).
    pub fn clear(&mut self) {
        self.pending.clear();
        self.queue.clear();
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_counting() {
        let mut ro = ReadOnly::new();
        ro.add_request(5, 1, b"a".to_vec());

        assert_eq!(ro.receive_ack(2, b"a"), 1);
        assert_eq!(ro.receive_ack(3, b"a"), 2);
        // Duplicate acks do not inflate the count.
        assert_eq!(ro.receive_ack(2, b"a"), 2);
    }

    #[test]
    fn test_unknown_context_acks_nothing() {
        let mut ro = ReadOnly::new();
        assert_eq!(ro.receive_ack(2, b"nope"), 0);
        assert_eq!(ro.receive_ack(2, b""), 0);
    }

    #[test]
    fn test_advance_releases_in_arrival_order() {
        let mut ro = ReadOnly::new();
        ro.add_request(5, 1, b"a".to_vec());
        ro.add_request(6, 2, b"b".to_vec());
        ro.add_request(7, 1, b"c".to_vec());

        let released = ro.advance(b"b");
        let contexts: Vec<_> = released.iter().map(|s| s.context.clone()).collect();
        assert_eq!(contexts, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(released[0].index, 5);
        assert_eq!(released[1].from, 2);

        // "c" is still pending.
        assert_eq!(ro.pending_count(), 1);
        let rest = ro.advance(b"c");
        assert_eq!(rest.len(), 1);
        assert_eq!(ro.pending_count(), 0);
    }

    #[test]
    fn test_advance_unknown_context_is_a_no_op() {
        let mut ro = ReadOnly::new();
        ro.add_request(5, 1, b"a".to_vec());
        assert!(ro.advance(b"zz").is_empty());
        assert_eq!(ro.pending_count(), 1);
    }

    #[test]
    fn test_duplicate_request_restarts_acks() {
        let mut ro = ReadOnly::new();
        ro.add_request(5, 1, b"a".to_vec());
        ro.receive_ack(2, b"a");

        ro.add_request(9, 3, b"a".to_vec());
        assert_eq!(ro.receive_ack(2, b"a"), 1);
        let released = ro.advance(b"a");
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].from, 3);
        // Commit index of the first registration is kept.
        assert_eq!(released[0].index, 5);
    }
}
