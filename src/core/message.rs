//! Wire types for the consensus protocol
//!
//! Every RPC travels as a single tagged [`Message`] record; fields that
//! are not meaningful for a given [`MessageKind`] stay zero/empty.

use serde::{Deserialize, Serialize};

/// Reserved node identifier meaning "no node".
pub const INVALID_ID: u64 = 0;
/// Reserved term meaning "no term".
pub const INVALID_TERM: u64 = 0;
/// Reserved log index meaning "no entry".
pub const INVALID_INDEX: u64 = 0;

/// Discriminant of a protocol message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Candidate asks for a vote in its (already bumped) term
    VoteRequest,
    /// Reply to `VoteRequest`
    VoteResponse,
    /// Pre-candidate probes electability at `term + 1` without bumping
    PreVoteRequest,
    /// Reply to `PreVoteRequest`
    PreVoteResponse,
    /// Leader replicates log entries (also serves as the commit carrier)
    AppendRequest,
    /// Reply to `AppendRequest`
    AppendResponse,
    /// Leader asserts liveness; may carry a read-index context
    HeartbeatRequest,
    /// Reply to `HeartbeatRequest`, echoing the context
    HeartbeatResponse,
    /// Leader ships a snapshot to a lagging follower
    SnapshotRequest,
    /// Reply to `SnapshotRequest`
    SnapshotResponse,
    /// Follower forwards a linearizable-read request to the leader
    ReadIndexRequest,
    /// Leader answers a remote read-index request
    ReadIndexResponse,
    /// Synthesized locally by the host when a send fails; never on the wire
    Unreachable,
}

/// A single replicated log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Position in the log (1-indexed, dense)
    pub index: u64,
    /// Term of the leader that appended this entry
    pub term: u64,
    /// Opaque command for the state machine; empty for leader no-ops
    pub data: Vec<u8>,
}

/// What a snapshot covers: everything up to and including `index`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Last log index included in the snapshot
    pub index: u64,
    /// Term of the entry at `index`
    pub term: u64,
}

/// A state-machine snapshot plus the log position it covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    /// Serialized state machine contents
    pub data: Vec<u8>,
}

/// The protocol message. One record for all RPCs; unused fields are
/// zero/empty for a given kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    /// Sender node ID
    pub from: u64,
    /// Destination node ID
    pub to: u64,
    /// Sender's term (see PreVote rules for the exceptions)
    pub term: u64,
    /// AppendRequest: index of the entry preceding `entries`
    pub log_index: u64,
    /// AppendRequest: term of the entry at `log_index`
    pub log_term: u64,
    /// AppendRequest/HeartbeatRequest: commit index for the receiver.
    /// Responses: the index the reply refers to.
    pub index: u64,
    /// AppendResponse: match point on accept, back-off hint on reject
    pub reject_hint: u64,
    /// Whether the addressed request was refused
    pub reject: bool,
    /// Opaque read-index context, echoed end to end
    pub context: Vec<u8>,
    /// Entries carried by an AppendRequest
    pub entries: Vec<Entry>,
    /// Snapshot carried by a SnapshotRequest
    pub snapshot: Option<Snapshot>,
}

impl Message {
    /// A message of the given kind addressed to `to`, all other fields
    /// zero/empty.
    pub fn new(kind: MessageKind, to: u64) -> Self {
        Message {
            kind,
            from: INVALID_ID,
            to,
            term: INVALID_TERM,
            log_index: INVALID_INDEX,
            log_term: INVALID_TERM,
            index: INVALID_INDEX,
            reject_hint: INVALID_INDEX,
            reject: false,
            context: Vec::new(),
            entries: Vec::new(),
            snapshot: None,
        }
    }

    /// True for the request kinds that expect a reply carrying our term
    /// when they arrive stale.
    pub fn is_request(&self) -> bool {
        matches!(
            self.kind,
            MessageKind::VoteRequest
                | MessageKind::PreVoteRequest
                | MessageKind::AppendRequest
                | MessageKind::HeartbeatRequest
                | MessageKind::SnapshotRequest
        )
    }
}

/// Durable per-node election state; must be persisted before any
/// message that reflects it is sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub vote: Option<u64>,
}

/// Notification that reads tagged `request_ctx` are linearizable once
/// the applied index reaches `index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadState {
    pub index: u64,
    pub request_ctx: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_is_zeroed() {
        let msg = Message::new(MessageKind::AppendRequest, 3);
        assert_eq!(msg.to, 3);
        assert_eq!(msg.from, INVALID_ID);
        assert_eq!(msg.term, INVALID_TERM);
        assert!(msg.entries.is_empty());
        assert!(msg.snapshot.is_none());
        assert!(!msg.reject);
    }

    #[test]
    fn test_request_classification() {
        assert!(Message::new(MessageKind::VoteRequest, 1).is_request());
        assert!(Message::new(MessageKind::HeartbeatRequest, 1).is_request());
        assert!(!Message::new(MessageKind::AppendResponse, 1).is_request());
        assert!(!Message::new(MessageKind::Unreachable, 1).is_request());
    }
}
