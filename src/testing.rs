//! Deterministic cluster simulator for integration tests
//!
//! Runs N consensus cores in one thread with an in-process message
//! pump. Time is explicit: `tick()` advances every connected node one
//! tick and then delivers messages until the cluster is quiet, so a
//! whole election happens inside a single `tick()` call. Nodes use the
//! deterministic election stagger (`randomize_timeout = false`), which
//! makes every run reproducible.
//!
//! `disconnect` drops traffic to and from a node without tearing it
//! down, which is how the tests model partitions and crashes.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::core::config::RaftConfig;
use crate::core::message::{Entry, Message, ReadState, Snapshot, SnapshotMetadata};
use crate::core::raft_core::{ProposeError, RaftCallback, RaftCore, Role};

/// What one simulated node's host has observed.
#[derive(Default)]
struct SimHostState {
    outbox: VecDeque<Message>,
    applied: Vec<Entry>,
    read_states: Vec<ReadState>,
    available: Option<Snapshot>,
}

/// Host callback for one simulated node; shared with the cluster so
/// tests can inspect what came out.
#[derive(Clone, Default)]
struct SimHost(Arc<Mutex<SimHostState>>);

impl RaftCallback for SimHost {
    fn send(&mut self, msg: Message) {
        self.0.lock().unwrap().outbox.push_back(msg);
    }

    fn apply_entry(&mut self, entry: &Entry) {
        self.0.lock().unwrap().applied.push(entry.clone());
    }

    fn save_read_state(&mut self, read_state: ReadState) {
        self.0.lock().unwrap().read_states.push(read_state);
    }

    fn apply_snapshot(&mut self, snapshot: &Snapshot) {
        // Sim snapshots are the serialized applied-entry list.
        let applied: Vec<Entry> =
            serde_json::from_slice(&snapshot.data).expect("undecodable sim snapshot");
        self.0.lock().unwrap().applied = applied;
    }

    fn read_snapshot(&mut self) -> Option<Snapshot> {
        self.0.lock().unwrap().available.clone()
    }
}

struct SimNode {
    id: u64,
    core: RaftCore,
    host: SimHost,
}

/// An in-process cluster of consensus cores with a lossless network
/// and explicit partitions.
pub struct Cluster {
    nodes: Vec<SimNode>,
    connected: Vec<bool>,
    election_tick: usize,
}

impl Cluster {
    /// A cluster of `n` nodes with IDs `1..=n`, pre-vote enabled.
    pub fn new(n: usize) -> Self {
        let ids: Vec<u64> = (1..=n as u64).collect();
        let mut nodes = Vec::with_capacity(n);
        for &id in &ids {
            let peers: Vec<u64> = ids.iter().copied().filter(|&p| p != id).collect();
            let config = RaftConfig::new(id, peers).with_randomize_timeout(false);
            let host = SimHost::default();
            let core = RaftCore::new(&config, Box::new(host.clone())).expect("valid sim config");
            nodes.push(SimNode { id, core, host });
        }
        Cluster { nodes, connected: vec![true; n], election_tick: 10 }
    }

    /// The base election timeout, in ticks, shared by every node.
    pub fn election_ticks(&self) -> usize {
        self.election_tick
    }

    /// Advance every connected node one tick, then deliver messages
    /// until the cluster is quiet.
    pub fn tick(&mut self) {
        for i in 0..self.nodes.len() {
            if self.connected[i] {
                self.nodes[i].core.tick();
            }
        }
        self.deliver_messages();
    }

    pub fn tick_n(&mut self, n: usize) {
        for _ in 0..n {
            self.tick();
        }
    }

    /// Pump queued messages to a fixpoint. Traffic to or from a
    /// disconnected node evaporates.
    fn deliver_messages(&mut self) {
        loop {
            let mut delivered = false;
            for i in 0..self.nodes.len() {
                let msgs: Vec<Message> = {
                    let mut host = self.nodes[i].host.0.lock().unwrap();
                    host.outbox.drain(..).collect()
                };
                if !self.connected[i] {
                    continue; // sender is cut off; messages dropped
                }
                for msg in msgs {
                    let Some(j) = self.index_of(msg.to) else { continue };
                    if !self.connected[j] {
                        continue;
                    }
                    self.nodes[j].core.step(msg);
                    delivered = true;
                }
            }
            if !delivered {
                break;
            }
        }
    }

    /// Detach a node from the network (both directions).
    pub fn disconnect(&mut self, id: u64) {
        let i = self.index_of(id).expect("unknown node");
        self.connected[i] = false;
    }

    /// Reattach a node.
    pub fn connect(&mut self, id: u64) {
        let i = self.index_of(id).expect("unknown node");
        self.connected[i] = true;
    }

    /// `(term, is_leader)` as seen by one node.
    pub fn state(&self, id: u64) -> (u64, bool) {
        let node = self.node(id);
        (node.core.term(), node.core.role() == Role::Leader)
    }

    pub fn role(&self, id: u64) -> Role {
        self.node(id).core.role()
    }

    pub fn leader_id_at(&self, id: u64) -> Option<u64> {
        self.node(id).core.leader_id()
    }

    pub fn commit_index(&self, id: u64) -> u64 {
        self.node(id).core.log().commit_index()
    }

    /// Everything a node's state machine has applied, in order.
    pub fn applied(&self, id: u64) -> Vec<Entry> {
        self.node(id).host.0.lock().unwrap().applied.clone()
    }

    /// Read states delivered to a node's host.
    pub fn read_states(&self, id: u64) -> Vec<ReadState> {
        self.node(id).host.0.lock().unwrap().read_states.clone()
    }

    /// Tick until exactly one connected node is leader and return its
    /// ID. Panics if any term ever has two leaders, or if no leader
    /// emerges within a generous number of election timeouts.
    pub fn check_one_leader(&mut self) -> u64 {
        for _ in 0..10 {
            self.tick_n(2 * self.election_tick);

            let mut by_term: HashMap<u64, Vec<u64>> = HashMap::new();
            for (i, node) in self.nodes.iter().enumerate() {
                if self.connected[i] && node.core.role() == Role::Leader {
                    by_term.entry(node.core.term()).or_default().push(node.id);
                }
            }
            for (term, leaders) in &by_term {
                assert!(leaders.len() <= 1, "term {} has {} leaders", term, leaders.len());
            }
            if let Some((_, leaders)) = by_term.iter().max_by_key(|&(term, _)| *term) {
                return leaders[0];
            }
        }
        panic!("expected one leader, got none");
    }

    /// Assert that no connected node claims leadership.
    pub fn check_no_leader(&self) {
        for (i, node) in self.nodes.iter().enumerate() {
            if self.connected[i] {
                assert!(
                    node.core.role() != Role::Leader,
                    "expected no leader, but {} claims to be one",
                    node.id
                );
            }
        }
    }

    /// Assert every connected node agrees on the term and return it.
    pub fn check_terms(&self) -> u64 {
        let mut term = None;
        for (i, node) in self.nodes.iter().enumerate() {
            if self.connected[i] {
                match term {
                    None => term = Some(node.core.term()),
                    Some(t) => assert_eq!(t, node.core.term(), "servers disagree on term"),
                }
            }
        }
        term.expect("no connected nodes")
    }

    /// Propose through a specific node and pump the result.
    pub fn propose(&mut self, id: u64, data: Vec<u8>) -> Result<(u64, u64), ProposeError> {
        let i = self.index_of(id).expect("unknown node");
        let result = self.nodes[i].core.propose(data);
        self.deliver_messages();
        result
    }

    /// Issue a read-index request through a specific node and pump.
    pub fn read_index(&mut self, id: u64, ctx: Vec<u8>) -> Result<(), ProposeError> {
        let i = self.index_of(id).expect("unknown node");
        let result = self.nodes[i].core.read_index(ctx);
        self.deliver_messages();
        result
    }

    /// How many nodes have applied the entry at `index`, and its data.
    /// Panics if two nodes applied different data there (state machine
    /// safety).
    pub fn committed_number(&self, index: u64) -> (usize, Option<Vec<u8>>) {
        let mut count = 0;
        let mut value: Option<Vec<u8>> = None;
        for node in &self.nodes {
            let applied = node.host.0.lock().unwrap();
            if let Some(entry) = applied.applied.iter().find(|e| e.index == index) {
                if let Some(ref seen) = value {
                    assert_eq!(
                        *seen, entry.data,
                        "nodes applied different values at index {}",
                        index
                    );
                } else {
                    value = Some(entry.data.clone());
                }
                count += 1;
            }
        }
        (count, value)
    }

    /// Drive one command to full agreement: find a node that accepts
    /// the proposal, then wait for `expected` nodes to apply it.
    /// Returns the log index it landed at.
    pub fn one(&mut self, data: Vec<u8>, expected: usize) -> u64 {
        for _ in 0..40 {
            let mut proposed = None;
            for i in 0..self.nodes.len() {
                if !self.connected[i] {
                    continue;
                }
                let id = self.nodes[i].id;
                if let Ok((index, _)) = self.propose(id, data.clone()) {
                    proposed = Some(index);
                    break;
                }
            }
            let Some(index) = proposed else {
                // Nobody is leader yet; let elections happen.
                self.tick_n(2 * self.election_tick);
                continue;
            };
            for _ in 0..20 {
                let (count, value) = self.committed_number(index);
                if count >= expected && value.as_deref() == Some(&data[..]) {
                    return index;
                }
                self.tick();
            }
            // The entry may have been lost to a leadership change;
            // propose again.
        }
        panic!("one({:?}) failed to reach agreement", data);
    }

    /// Snapshot a node's applied state and compact its log, making the
    /// snapshot available for follower catch-up.
    pub fn take_snapshot(&mut self, id: u64) {
        let i = self.index_of(id).expect("unknown node");
        let applied_index = self.nodes[i].core.log().applied();
        let term = self.nodes[i].core.log().term(applied_index);
        let data = {
            let host = self.nodes[i].host.0.lock().unwrap();
            serde_json::to_vec(&host.applied).expect("sim snapshot encode")
        };
        self.nodes[i].host.0.lock().unwrap().available = Some(Snapshot {
            metadata: SnapshotMetadata { index: applied_index, term },
            data,
        });
        self.nodes[i].core.compact(applied_index);
    }

    pub fn first_log_index(&self, id: u64) -> u64 {
        self.node(id).core.log().first_index()
    }

    fn node(&self, id: u64) -> &SimNode {
        let i = self.index_of(id).expect("unknown node");
        &self.nodes[i]
    }

    fn index_of(&self, id: u64) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == id)
    }
}
