//! Consensus role state machine and message dispatcher
//!
//! [`RaftCore`] is a single-threaded deterministic state machine. The
//! host drives it through `tick`, `step`, `propose`, and `read_index`;
//! every side effect comes back out synchronously through the
//! [`RaftCallback`] façade. There are no timers, threads, or I/O in
//! here — deadlines are counted in ticks, which makes the whole core
//! simulatable.

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::config::{ConfigError, RaftConfig};
use super::log::RaftLog;
use super::message::{Entry, HardState, Message, MessageKind, ReadState, Snapshot, SnapshotMetadata};
use super::peer::{Peer, VoteState};
use super::read_only::ReadOnly;

/// Estimated wire overhead per entry when sizing append batches.
const ENTRY_OVERHEAD: u64 = 16;

/// Outcome of a local request that only a leader can serve.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProposeError {
    #[error("node {id} is not the leader (known leader: {leader:?})")]
    NotLeader { id: u64, leader: Option<u64> },
}

/// The role a node currently plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Passive: replicates what the leader sends, votes when asked
    Follower,
    /// Probing electability without disturbing the cluster
    PreCandidate,
    /// Running a real election in a bumped term
    Candidate,
    /// Serving proposals and driving replication
    Leader,
}

/// Host façade the core emits all side effects through.
///
/// Calls happen synchronously inside `tick`/`step`/`propose`/
/// `read_index`; the host flushes the effects afterwards. `send` has no
/// delivery guarantee. `read_snapshot` may return `None` to mean "not
/// ready, ask again on a later tick". `apply_snapshot` is synchronous;
/// a host that installs snapshots slowly pays that cost inside the core
/// call (see the server host for how the flush ordering keeps the
/// response behind the install).
pub trait RaftCallback: Send {
    /// Queue a protocol message for the transport.
    fn send(&mut self, msg: Message);
    /// A committed entry is ready for the state machine. Delivered in
    /// index order, exactly once per entry; no-ops carry empty data.
    fn apply_entry(&mut self, entry: &Entry);
    /// Reads tagged with `request_ctx` are linearizable at `index`.
    fn save_read_state(&mut self, read_state: ReadState);
    /// Install a snapshot received from the leader.
    fn apply_snapshot(&mut self, snapshot: &Snapshot);
    /// Produce a snapshot for follower catch-up, or `None` if one is
    /// not available right now.
    fn read_snapshot(&mut self) -> Option<Snapshot>;
}

/// The consensus core for one node.
pub struct RaftCore {
    id: u64,
    term: u64,
    vote: Option<u64>,
    leader_id: Option<u64>,
    role: Role,
    peers: Vec<Peer>,
    log: RaftLog,
    read_only: ReadOnly,
    election_elapsed: usize,
    heartbeat_elapsed: usize,
    randomized_election_timeout: usize,
    election_tick: usize,
    heartbeat_tick: usize,
    max_size_per_msg: u64,
    pre_vote: bool,
    randomize_timeout: bool,
    callback: Box<dyn RaftCallback>,
}

impl RaftCore {
    /// Build a core from a validated configuration. The node starts as
    /// a follower at term 0 with an empty log.
    pub fn new(config: &RaftConfig, callback: Box<dyn RaftCallback>) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut core = RaftCore {
            id: config.id,
            term: 0,
            vote: None,
            leader_id: None,
            role: Role::Follower,
            peers: config.peers.iter().map(|&id| Peer::new(id)).collect(),
            log: RaftLog::new(),
            read_only: ReadOnly::new(),
            election_elapsed: 0,
            heartbeat_elapsed: 0,
            randomized_election_timeout: 0,
            election_tick: config.election_tick,
            heartbeat_tick: config.heartbeat_tick,
            max_size_per_msg: config.max_size_per_msg,
            pre_vote: config.pre_vote,
            randomize_timeout: config.randomize_timeout,
            callback,
        };
        core.reset_randomized_election_timeout();
        Ok(core)
    }

    /// Restore durable state at host startup. `entries` must continue
    /// the snapshot; commit state is re-learned from the leader.
    pub fn load(&mut self, hard_state: HardState, snapshot: SnapshotMetadata, entries: Vec<Entry>) {
        self.term = hard_state.term;
        self.vote = hard_state.vote;
        self.log = RaftLog::from_persisted(snapshot, entries);
    }

    // === Inspection ===

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn term(&self) -> u64 {
        self.term
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn leader_id(&self) -> Option<u64> {
        self.leader_id
    }

    pub fn log(&self) -> &RaftLog {
        &self.log
    }

    pub fn hard_state(&self) -> HardState {
        HardState { term: self.term, vote: self.vote }
    }

    /// Minimum cluster fraction that decides elections and commits.
    pub fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Replication progress toward one peer (leader bookkeeping).
    pub fn progress(&self, id: u64) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    // === Entry points ===

    /// One timer pulse. Followers and (pre-)candidates count toward the
    /// election timeout; leaders count toward the heartbeat.
    pub fn tick(&mut self) {
        match self.role {
            Role::Leader => {
                self.heartbeat_elapsed += 1;
                if self.heartbeat_elapsed >= self.heartbeat_tick {
                    self.heartbeat_elapsed = 0;
                    self.broadcast_heartbeat(Vec::new());
                }
            }
            _ => {
                self.election_elapsed += 1;
                if self.election_elapsed >= self.randomized_election_timeout {
                    self.election_elapsed = 0;
                    self.campaign();
                }
            }
        }
    }

    /// Ingest one inbound protocol message.
    pub fn step(&mut self, msg: Message) {
        // Unreachable is synthesized by the local host and carries no
        // meaningful term.
        if msg.kind == MessageKind::Unreachable {
            self.handle_unreachable(&msg);
            return;
        }

        if msg.term > self.term {
            match msg.kind {
                // Pre-vote traffic never moves the local term: requests
                // campaign at term+1 without anyone committing to it,
                // and granted responses echo that speculative term.
                MessageKind::PreVoteRequest | MessageKind::PreVoteResponse => {}
                MessageKind::AppendRequest
                | MessageKind::HeartbeatRequest
                | MessageKind::SnapshotRequest => {
                    self.become_follower(msg.term, Some(msg.from));
                }
                _ => self.become_follower(msg.term, None),
            }
        } else if msg.term < self.term {
            self.reply_stale(&msg);
            return;
        }

        // Vote traffic is answered in every role.
        match msg.kind {
            MessageKind::VoteRequest => {
                self.handle_vote(&msg);
                return;
            }
            MessageKind::PreVoteRequest => {
                self.handle_pre_vote(&msg);
                return;
            }
            _ => {}
        }

        match self.role {
            Role::Leader => self.step_leader(&msg),
            Role::Follower => self.step_follower(&msg),
            Role::PreCandidate | Role::Candidate => self.step_candidate(&msg),
        }
    }

    /// Append a client command to the replicated log. Only a leader can
    /// accept it; the entry commits once a quorum holds it.
    pub fn propose(&mut self, data: Vec<u8>) -> Result<(u64, u64), ProposeError> {
        if self.role != Role::Leader {
            return Err(ProposeError::NotLeader { id: self.id, leader: self.leader_id });
        }
        let index = self.log.last_index() + 1;
        let term = self.term;
        self.log.append(vec![Entry { index, term, data }]);
        debug!("{} [term: {}] proposed entry at index {}", self.id, self.term, index);
        self.broadcast_append();
        Ok((index, term))
    }

    /// Request a linearizable read point tagged with `ctx`. A leader
    /// validates it against a heartbeat quorum; a follower forwards it
    /// to the leader it knows about.
    pub fn read_index(&mut self, ctx: Vec<u8>) -> Result<(), ProposeError> {
        if self.role == Role::Leader {
            let mut msg = Message::new(MessageKind::ReadIndexRequest, self.id);
            msg.from = self.id;
            msg.context = ctx;
            self.handle_read_index_request(&msg);
            return Ok(());
        }
        match self.leader_id {
            Some(leader) => {
                let mut msg = Message::new(MessageKind::ReadIndexRequest, leader);
                msg.context = ctx;
                self.send(msg);
                Ok(())
            }
            None => Err(ProposeError::NotLeader { id: self.id, leader: None }),
        }
    }

    /// Drop applied entries up to `index` after the host snapshotted
    /// the state machine at that point.
    pub fn compact(&mut self, index: u64) {
        self.log.compact_to(index);
    }

    // === Role transitions ===

    fn reset_randomized_election_timeout(&mut self) {
        self.randomized_election_timeout = if self.randomize_timeout {
            rand::rng().random_range(self.election_tick..self.election_tick * 2)
        } else {
            // Deterministic per-node stagger for simulation.
            self.election_tick + (self.id as usize % self.election_tick)
        };
    }

    fn become_follower(&mut self, term: u64, leader_id: Option<u64>) {
        if term > self.term {
            self.term = term;
            self.vote = None;
        }
        let was = self.role;
        self.role = Role::Follower;
        self.leader_id = leader_id;
        self.election_elapsed = 0;
        self.heartbeat_elapsed = 0;
        self.reset_randomized_election_timeout();
        self.read_only.clear();
        if was != Role::Follower {
            info!("{} became follower at term {} (was {:?})", self.id, self.term, was);
        }
    }

    fn become_pre_candidate(&mut self) {
        self.role = Role::PreCandidate;
        self.leader_id = None;
        self.election_elapsed = 0;
        self.reset_randomized_election_timeout();
        self.read_only.clear();
        for peer in &mut self.peers {
            peer.reset_vote();
        }
        if self.quorum() <= 1 {
            self.become_candidate();
            return;
        }
        info!("{} [term: {}] starts pre-vote campaign", self.id, self.term);
        let last_index = self.log.last_index();
        let last_term = self.log.last_term();
        for i in 0..self.peers.len() {
            let to = self.peers[i].id;
            let mut msg = Message::new(MessageKind::PreVoteRequest, to);
            // Campaign at the next term without committing to it.
            msg.term = self.term + 1;
            msg.log_index = last_index;
            msg.log_term = last_term;
            self.send(msg);
        }
    }

    fn become_candidate(&mut self) {
        self.term += 1;
        self.vote = Some(self.id);
        self.role = Role::Candidate;
        self.leader_id = None;
        self.election_elapsed = 0;
        self.reset_randomized_election_timeout();
        self.read_only.clear();
        for peer in &mut self.peers {
            peer.reset_vote();
        }
        if self.quorum() <= 1 {
            self.become_leader();
            return;
        }
        info!("{} [term: {}] starts election", self.id, self.term);
        let last_index = self.log.last_index();
        let last_term = self.log.last_term();
        for i in 0..self.peers.len() {
            let to = self.peers[i].id;
            let mut msg = Message::new(MessageKind::VoteRequest, to);
            msg.log_index = last_index;
            msg.log_term = last_term;
            self.send(msg);
        }
    }

    fn become_leader(&mut self) {
        assert!(self.role != Role::Follower, "follower cannot become leader directly");
        self.role = Role::Leader;
        self.leader_id = Some(self.id);
        self.heartbeat_elapsed = 0;
        let last_index = self.log.last_index();
        for peer in &mut self.peers {
            peer.reset(last_index);
        }
        info!("{} became leader at term {}", self.id, self.term);
        // A no-op at the new term lets entries from previous terms
        // commit through the current-term rule.
        self.log.append(vec![Entry { index: last_index + 1, term: self.term, data: Vec::new() }]);
        self.broadcast_append();
    }

    fn campaign(&mut self) {
        if self.pre_vote {
            self.become_pre_candidate();
        } else {
            self.become_candidate();
        }
    }

    // === Per-role dispatch ===

    fn step_leader(&mut self, msg: &Message) {
        match msg.kind {
            MessageKind::HeartbeatResponse => self.handle_heartbeat_response(msg),
            MessageKind::AppendResponse => self.handle_append_response(msg),
            MessageKind::SnapshotResponse => self.handle_snapshot_response(msg),
            MessageKind::ReadIndexRequest => self.handle_read_index_request(msg),
            _ => {
                debug!("{} [term: {}] leader ignores {:?} from {}", self.id, self.term, msg.kind, msg.from);
            }
        }
    }

    fn step_follower(&mut self, msg: &Message) {
        match msg.kind {
            MessageKind::AppendRequest => {
                self.become_follower(self.term, Some(msg.from));
                self.handle_append_entries(msg);
            }
            MessageKind::HeartbeatRequest => {
                self.become_follower(self.term, Some(msg.from));
                self.handle_heartbeat(msg);
            }
            MessageKind::SnapshotRequest => {
                self.become_follower(self.term, Some(msg.from));
                self.handle_snapshot_request(msg);
            }
            MessageKind::ReadIndexResponse => {
                self.become_follower(self.term, Some(msg.from));
                debug!(
                    "{} [term: {}] read state at index {} from leader {}",
                    self.id, self.term, msg.index, msg.from
                );
                self.callback.save_read_state(ReadState {
                    index: msg.index,
                    request_ctx: msg.context.clone(),
                });
            }
            _ => {
                debug!("{} [term: {}] follower ignores {:?} from {}", self.id, self.term, msg.kind, msg.from);
            }
        }
    }

    fn step_candidate(&mut self, msg: &Message) {
        match msg.kind {
            // Stale pre-vote responses can still arrive after we moved
            // on to the real election; count only the matching kind.
            MessageKind::PreVoteResponse if self.role == Role::PreCandidate => {
                self.handle_vote_response(msg);
            }
            MessageKind::VoteResponse if self.role == Role::Candidate => {
                self.handle_vote_response(msg);
            }
            // A current leader at our term wins; fall back and process.
            MessageKind::AppendRequest => {
                self.become_follower(msg.term.max(self.term), Some(msg.from));
                self.handle_append_entries(msg);
            }
            MessageKind::HeartbeatRequest => {
                self.become_follower(msg.term.max(self.term), Some(msg.from));
                self.handle_heartbeat(msg);
            }
            MessageKind::SnapshotRequest => {
                self.become_follower(msg.term.max(self.term), Some(msg.from));
                self.handle_snapshot_request(msg);
            }
            _ => {
                debug!("{} [term: {}] {:?} ignores {:?} from {}", self.id, self.term, self.role, msg.kind, msg.from);
            }
        }
    }

    /// A request from a lower term gets a reply carrying our term so
    /// the sender can catch up; stale responses are dropped.
    fn reply_stale(&mut self, msg: &Message) {
        if !msg.is_request() {
            debug!(
                "{} [term: {}] drops stale {:?} from {} [term: {}]",
                self.id, self.term, msg.kind, msg.from, msg.term
            );
            return;
        }
        let kind = match msg.kind {
            MessageKind::VoteRequest => MessageKind::VoteResponse,
            MessageKind::PreVoteRequest => MessageKind::PreVoteResponse,
            MessageKind::AppendRequest => MessageKind::AppendResponse,
            MessageKind::HeartbeatRequest => MessageKind::HeartbeatResponse,
            MessageKind::SnapshotRequest => MessageKind::SnapshotResponse,
            _ => unreachable!("is_request covers every request kind"),
        };
        let mut reply = Message::new(kind, msg.from);
        reply.term = self.term;
        reply.reject = true;
        self.send(reply);
    }

    // === Vote handling (any role) ===

    fn handle_pre_vote(&mut self, msg: &Message) {
        let mut reply = Message::new(MessageKind::PreVoteResponse, msg.from);
        // Leader stickiness: while we believe the leader is alive,
        // refuse to help anyone start an election.
        let leader_alive = self.leader_id.is_some() && self.election_elapsed < self.election_tick;
        if leader_alive || msg.term < self.term || !self.log.is_up_to_date(msg.log_index, msg.log_term) {
            reply.reject = true;
            reply.term = self.term;
            info!("{} [term: {}] rejects pre-vote from {}", self.id, self.term, msg.from);
        } else {
            // Echo the campaign term, not ours: a previously partitioned
            // pre-candidate with a stale local term would otherwise drop
            // the response as out of date.
            reply.reject = false;
            reply.term = msg.term;
            info!("{} [term: {}] grants pre-vote to {}", self.id, self.term, msg.from);
        }
        self.send(reply);
    }

    fn handle_vote(&mut self, msg: &Message) {
        let mut reply = Message::new(MessageKind::VoteResponse, msg.from);
        let can_vote = self.vote.is_none() || self.vote == Some(msg.from);
        if can_vote && self.log.is_up_to_date(msg.log_index, msg.log_term) {
            self.vote = Some(msg.from);
            self.election_elapsed = 0;
            reply.reject = false;
            info!("{} [term: {}] grants vote to {}", self.id, self.term, msg.from);
        } else {
            reply.reject = true;
            info!("{} [term: {}] rejects vote for {}", self.id, self.term, msg.from);
        }
        self.send(reply);
    }

    fn handle_vote_response(&mut self, msg: &Message) {
        if msg.reject {
            info!("{} [term: {}] {:?} rejection from {}", self.id, self.term, msg.kind, msg.from);
        } else {
            info!("{} [term: {}] {:?} grant from {}", self.id, self.term, msg.kind, msg.from);
        }
        let Some(i) = self.peer_index(msg.from) else { return };
        self.peers[i].update_vote(msg.reject);

        // Self always counts as granted.
        let granted = self.count_votes(VoteState::Granted) + 1;
        if granted >= self.quorum() {
            if self.role == Role::Candidate {
                info!("{} [term: {}] wins election", self.id, self.term);
                self.become_leader();
            } else {
                // Pre-vote quorum reached; run the real election.
                self.become_candidate();
            }
            return;
        }

        let rejected = self.count_votes(VoteState::Rejected);
        if rejected >= self.quorum() {
            self.become_follower(self.term.max(msg.term), None);
        }
    }

    fn count_votes(&self, state: VoteState) -> usize {
        self.peers.iter().filter(|p| p.vote == state).count()
    }

    // === Leader handlers ===

    fn handle_heartbeat_response(&mut self, msg: &Message) {
        let Some(i) = self.peer_index(msg.from) else { return };

        // The peer is alive; if it trails us, make sure replication to
        // it is running (a lost probe response must not wedge it).
        if self.peers[i].matched < self.log.last_index() {
            self.peers[i].resume();
            self.send_replication(i);
        }

        let acks = self.read_only.receive_ack(msg.from, &msg.context);
        if acks < self.quorum() {
            return;
        }
        debug!(
            "{} [term: {}] read quorum reached for ctx {:?}",
            self.id, self.term, msg.context
        );
        self.advance_read_only(&msg.context);
    }

    fn handle_append_response(&mut self, msg: &Message) {
        debug!(
            "{} received append response from {} [reject: {}, idx: {}, hint: {}]",
            self.id, msg.from, msg.reject, msg.index, msg.reject_hint
        );
        let Some(i) = self.peer_index(msg.from) else { return };
        let advanced = self.peers[i].handle_append_response(msg.reject, msg.index, msg.reject_hint);
        if advanced {
            if self.poll() {
                self.broadcast_append();
            }
        } else if msg.reject {
            // Keep probing for the match point right away instead of
            // waiting out a heartbeat interval.
            self.send_replication(i);
        }
    }

    fn handle_snapshot_response(&mut self, msg: &Message) {
        debug!(
            "{} received snapshot response from {} [reject: {}, idx: {}, hint: {}]",
            self.id, msg.from, msg.reject, msg.index, msg.reject_hint
        );
        let Some(i) = self.peer_index(msg.from) else { return };
        self.peers[i].handle_snapshot_response(msg.reject, msg.reject_hint);
        self.send_replication(i);
    }

    fn handle_unreachable(&mut self, msg: &Message) {
        if self.role != Role::Leader {
            return;
        }
        let Some(i) = self.peer_index(msg.from) else { return };
        self.peers[i].handle_unreachable();
        info!("{} cannot reach {}, replication dropped to probe", self.id, msg.from);
    }

    fn handle_read_index_request(&mut self, msg: &Message) {
        assert_eq!(self.role, Role::Leader, "read index request dispatched to a non-leader");
        // Serving reads before committing an entry of the current term
        // could miss entries committed by a predecessor (thesis 6.4).
        if self.log.term(self.log.commit_index()) != self.term {
            debug!(
                "{} [term: {}] drops read index request: no commit in this term yet",
                self.id, self.term
            );
            return;
        }
        self.read_only.add_request(self.log.commit_index(), msg.from, msg.context.clone());
        if self.quorum() > 1 {
            self.broadcast_heartbeat(msg.context.clone());
        } else {
            self.advance_read_only(&msg.context);
        }
    }

    fn advance_read_only(&mut self, ctx: &[u8]) {
        for status in self.read_only.advance(ctx) {
            if status.from == self.id {
                self.callback.save_read_state(ReadState {
                    index: status.index,
                    request_ctx: status.context,
                });
            } else {
                let mut reply = Message::new(MessageKind::ReadIndexResponse, status.from);
                reply.index = status.index;
                reply.context = status.context;
                self.send(reply);
            }
        }
    }

    /// Recompute the commit index from replication progress. Only
    /// entries of the current term count (Leader Completeness). Returns
    /// true when the commit advanced.
    fn poll(&mut self) -> bool {
        let mut matches: Vec<u64> = self.peers.iter().map(|p| p.matched).collect();
        matches.push(self.log.last_index());
        matches.sort_unstable();
        let candidate = matches[matches.len() - self.quorum()];
        if candidate > self.log.commit_index() && self.log.term(candidate) == self.term {
            self.log.commit_to(candidate);
            debug!("{} [term: {}] commit advanced to {}", self.id, self.term, candidate);
            self.apply_committed();
            return true;
        }
        false
    }

    // === Follower handlers ===

    fn handle_append_entries(&mut self, msg: &Message) {
        let mut reply = Message::new(MessageKind::AppendResponse, msg.from);
        reply.index = msg.log_index;
        if self.log.commit_index() > msg.log_index {
            // Stale but harmless: everything it covers is committed
            // here. Point the leader at our commit index.
            debug!(
                "{} [term: {}, commit: {}] answers expired append from {} [idx: {}]",
                self.id, self.term, self.log.commit_index(), msg.from, msg.log_index
            );
            reply.reject_hint = self.log.commit_index();
            reply.reject = false;
        } else {
            let (last_or_hint, ok) = self.log.try_append(msg.log_index, msg.log_term, &msg.entries);
            if ok {
                debug!(
                    "{} [term: {}, commit: {}] accepts append from {} [idx: {}, last: {}]",
                    self.id, self.term, self.log.commit_index(), msg.from, msg.log_index, last_or_hint
                );
                self.log.commit_to(msg.index.min(last_or_hint));
                self.apply_committed();
                reply.reject_hint = last_or_hint;
                reply.reject = false;
            } else {
                debug!(
                    "{} [logterm: {}, commit: {}, last: {}] rejects append [idx: {}] hint {} from {}",
                    self.id,
                    self.log.term(msg.log_index),
                    self.log.commit_index(),
                    self.log.last_index(),
                    msg.log_index,
                    last_or_hint,
                    msg.from
                );
                reply.reject_hint = last_or_hint;
                reply.reject = true;
            }
        }
        self.send(reply);
    }

    fn handle_heartbeat(&mut self, msg: &Message) {
        debug!("{} [term: {}] heartbeat from {}", self.id, self.term, msg.from);
        // The leader already capped msg.index at our matched index, so
        // committing to it cannot outrun our log.
        self.log.commit_to(msg.index);
        self.apply_committed();
        let mut reply = Message::new(MessageKind::HeartbeatResponse, msg.from);
        reply.context = msg.context.clone();
        self.send(reply);
    }

    fn handle_snapshot_request(&mut self, msg: &Message) {
        let Some(snapshot) = &msg.snapshot else {
            warn!("{} received snapshot request without snapshot from {}", self.id, msg.from);
            return;
        };
        let metadata = snapshot.metadata;
        let mut reply = Message::new(MessageKind::SnapshotResponse, msg.from);
        reply.index = metadata.index;
        reply.reject = false;
        if self.try_restore(snapshot) {
            info!(
                "{} [commit: {}] restored snapshot [index: {}, term: {}]",
                self.id, self.log.commit_index(), metadata.index, metadata.term
            );
            reply.reject_hint = self.log.last_index();
        } else {
            debug!(
                "{} [commit: {}] ignored snapshot [index: {}, term: {}]",
                self.id, self.log.commit_index(), metadata.index, metadata.term
            );
            // Not an error: the hint tells the leader where to resume
            // normal replication.
            reply.reject_hint = self.log.commit_index();
        }
        self.send(reply);
    }

    /// Decide whether an incoming snapshot actually replaces our log.
    fn try_restore(&mut self, snapshot: &Snapshot) -> bool {
        let metadata = snapshot.metadata;
        if metadata.index <= self.log.commit_index() {
            // Expired: we committed past it already.
            return false;
        }
        if self.log.term(metadata.index) == metadata.term {
            // Our log already carries the snapshot's tail; its entries
            // are known committed, so advance the cursor without
            // reinstalling state.
            self.log.commit_to(metadata.index);
            self.apply_committed();
            return false;
        }
        self.callback.apply_snapshot(snapshot);
        self.log.apply_snapshot_meta(metadata);
        true
    }

    // === Outbound ===

    /// Stamp and hand a message to the host transport queue.
    fn send(&mut self, mut msg: Message) {
        msg.from = self.id;
        // Vote traffic carries hand-picked terms (pre-vote campaigns
        // and grants run ahead of the local term).
        if msg.term == 0 {
            msg.term = self.term;
        }
        self.callback.send(msg);
    }

    /// Send entries or a snapshot to every peer that is ready for more.
    fn broadcast_append(&mut self) {
        if self.quorum() <= 1 {
            // Single-node cluster: nothing will answer, commit directly.
            self.poll();
            return;
        }
        for i in 0..self.peers.len() {
            self.send_replication(i);
        }
    }

    /// Append or snapshot toward one peer, respecting its pacing state.
    fn send_replication(&mut self, i: usize) {
        if self.peers[i].is_paused() {
            return;
        }
        if self.peers[i].next >= self.log.first_index() {
            self.send_append(i);
        } else {
            // The entries it needs are compacted away.
            self.send_snapshot_to(i);
        }
    }

    fn send_append(&mut self, i: usize) {
        let to = self.peers[i].id;
        let next = self.peers[i].next;
        let prev_index = next - 1;
        let mut msg = Message::new(MessageKind::AppendRequest, to);
        msg.index = self.log.commit_index();
        msg.log_index = prev_index;
        msg.log_term = self.log.term(prev_index);
        if self.log.last_index() >= next {
            let available = self.log.slice(next, self.log.last_index() + 1);
            // Soft size cap; the first entry always goes so progress
            // never stalls on one oversized entry.
            let mut keep = available.len();
            let mut size = 0u64;
            for (j, entry) in available.iter().enumerate().skip(1) {
                size += ENTRY_OVERHEAD + entry.data.len() as u64;
                if size > self.max_size_per_msg {
                    keep = j;
                    break;
                }
            }
            msg.entries = available[..keep].to_vec();
        }
        debug!(
            "{} [term: {}] sends append [idx: {}, term: {}, len: {}] to {} [matched: {}, next: {}]",
            self.id,
            self.term,
            msg.log_index,
            msg.log_term,
            msg.entries.len(),
            to,
            self.peers[i].matched,
            next
        );
        self.peers[i].send_entries(&msg.entries);
        self.send(msg);
    }

    fn send_snapshot_to(&mut self, i: usize) {
        let to = self.peers[i].id;
        let Some(snapshot) = self.callback.read_snapshot() else {
            // Being built right now; retry on a later tick.
            debug!("{} snapshot temporarily unavailable for {}", self.id, to);
            return;
        };
        info!(
            "{} [first: {}, commit: {}] sends snapshot [index: {}, term: {}] to {}",
            self.id,
            self.log.first_index(),
            self.log.commit_index(),
            snapshot.metadata.index,
            snapshot.metadata.term,
            to
        );
        self.peers[i].send_snapshot(snapshot.metadata.index);
        let mut msg = Message::new(MessageKind::SnapshotRequest, to);
        msg.snapshot = Some(snapshot);
        self.send(msg);
    }

    /// Heartbeat every peer, carrying a read-index context when one is
    /// being confirmed. The commit forwarded to each peer is capped at
    /// its matched index to preserve Log Matching.
    fn broadcast_heartbeat(&mut self, ctx: Vec<u8>) {
        for i in 0..self.peers.len() {
            let to = self.peers[i].id;
            let index = self.peers[i].matched.min(self.log.commit_index());
            let mut msg = Message::new(MessageKind::HeartbeatRequest, to);
            msg.index = index;
            msg.context = ctx.clone();
            self.send(msg);
        }
    }

    /// Hand newly committed entries to the host in index order.
    fn apply_committed(&mut self) {
        while self.log.applied() < self.log.commit_index() {
            let index = self.log.applied() + 1;
            let entry = self.log.entry(index).expect("committed entry missing from log").clone();
            self.callback.apply_entry(&entry);
            self.log.applied_to(index);
        }
    }

    fn peer_index(&self, id: u64) -> Option<usize> {
        self.peers.iter().position(|p| p.id == id)
    }
}

impl std::fmt::Debug for RaftCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftCore")
            .field("id", &self.id)
            .field("term", &self.term)
            .field("role", &self.role)
            .field("leader_id", &self.leader_id)
            .field("committed", &self.log.commit_index())
            .finish()
    }
}
