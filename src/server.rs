//! Async host driver for one consensus core
//!
//! [`RaftServer`] owns a [`RaftCore`] on a tokio task and serializes
//! its entry points: inbound messages from the transport arrive on a
//! mailbox, a ticker drives `tick()`, and clients talk through a
//! cloneable [`RaftHandle`]. After every core call the server flushes:
//! persist first, then apply, then hand messages to per-peer sender
//! tasks — so log entries are durable before any acknowledgement of
//! them leaves this node, and per-peer wire order is preserved.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::core::config::{ConfigError, RaftConfig};
use crate::core::message::{Entry, HardState, Message, MessageKind, ReadState, Snapshot, SnapshotMetadata};
use crate::core::raft_core::{ProposeError, RaftCallback, RaftCore, Role};
use crate::state_machine::Snapshotable;
use crate::storage::{Storage, StorageError};
use crate::transport::Transport;

/// Errors surfaced to clients of a [`RaftServer`].
#[derive(Debug, Error)]
pub enum RaftError {
    /// This node is not the leader (includes a hint if one is known)
    #[error("not the leader (known leader: {leader_hint:?})")]
    NotLeader { leader_hint: Option<u64> },
    /// The entry was overwritten by a competing leader before commit
    #[error("entry was superseded before commit")]
    NotCommitted,
    /// The state machine refused the command
    #[error("state machine error: {0}")]
    StateMachine(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The server task is gone
    #[error("server is shutting down")]
    Shutdown,
}

/// Timing and compaction knobs for the host, layered over the core's
/// tick-based [`RaftConfig`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub raft: RaftConfig,
    /// Wall-clock duration of one core tick
    pub tick_interval: Duration,
    /// Applied entries between automatic snapshots; 0 disables them
    pub snapshot_threshold: u64,
}

impl ServerConfig {
    pub fn new(raft: RaftConfig) -> Self {
        ServerConfig {
            raft,
            tick_interval: Duration::from_millis(100),
            snapshot_threshold: 0,
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }
}

/// A point-in-time view of one node, for clients and tests.
#[derive(Debug, Clone)]
pub struct Status {
    pub id: u64,
    pub role: Role,
    pub term: u64,
    pub leader_id: Option<u64>,
    pub commit_index: u64,
    pub applied: u64,
    pub last_log_index: u64,
}

enum Command {
    Propose { data: Vec<u8>, reply: oneshot::Sender<Result<String, RaftError>> },
    ReadIndex { reply: oneshot::Sender<Result<u64, RaftError>> },
    Status { reply: oneshot::Sender<Status> },
}

/// Handle for interacting with a running [`RaftServer`].
#[derive(Clone)]
pub struct RaftHandle {
    command_tx: mpsc::Sender<Command>,
    shutdown_tx: mpsc::Sender<()>,
}

impl RaftHandle {
    /// Replicate a command and wait for it to commit and apply.
    /// Returns the state machine's output.
    pub async fn propose(&self, data: Vec<u8>) -> Result<String, RaftError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Propose { data, reply: reply_tx })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        reply_rx.await.map_err(|_| RaftError::Shutdown)?
    }

    /// Obtain a linearizable read point: every entry committed before
    /// this call has an index at or below the returned one. Wait until
    /// the local applied index reaches it before reading local state.
    pub async fn read_index(&self) -> Result<u64, RaftError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::ReadIndex { reply: reply_tx })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        reply_rx.await.map_err(|_| RaftError::Shutdown)?
    }

    pub async fn status(&self) -> Result<Status, RaftError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Status { reply: reply_tx })
            .await
            .map_err(|_| RaftError::Shutdown)?;
        reply_rx.await.map_err(|_| RaftError::Shutdown)
    }

    /// Stop the server task gracefully.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Side effects captured from the core during one entry-point call,
/// drained by the server's flush.
#[derive(Default)]
struct OutboxInner {
    messages: Vec<Message>,
    applied: Vec<Entry>,
    read_states: Vec<ReadState>,
    installed: Vec<Snapshot>,
    /// Latest snapshot on disk, served to the core for follower
    /// catch-up
    available: Option<Snapshot>,
}

#[derive(Clone, Default)]
struct Outbox(Arc<Mutex<OutboxInner>>);

impl Outbox {
    fn drain(&self) -> OutboxInner {
        let mut inner = self.0.lock().unwrap();
        OutboxInner {
            messages: std::mem::take(&mut inner.messages),
            applied: std::mem::take(&mut inner.applied),
            read_states: std::mem::take(&mut inner.read_states),
            installed: std::mem::take(&mut inner.installed),
            available: None,
        }
    }

    fn set_available(&self, snapshot: Option<Snapshot>) {
        self.0.lock().unwrap().available = snapshot;
    }
}

impl RaftCallback for Outbox {
    fn send(&mut self, msg: Message) {
        self.0.lock().unwrap().messages.push(msg);
    }

    fn apply_entry(&mut self, entry: &Entry) {
        self.0.lock().unwrap().applied.push(entry.clone());
    }

    fn save_read_state(&mut self, read_state: ReadState) {
        self.0.lock().unwrap().read_states.push(read_state);
    }

    fn apply_snapshot(&mut self, snapshot: &Snapshot) {
        self.0.lock().unwrap().installed.push(snapshot.clone());
    }

    fn read_snapshot(&mut self) -> Option<Snapshot> {
        self.0.lock().unwrap().available.clone()
    }
}

/// Drives one consensus core: mailbox, ticker, client commands, and
/// the persist/apply/send flush in between.
pub struct RaftServer {
    core: RaftCore,
    outbox: Outbox,
    storage: Box<dyn Storage>,
    state_machine: Box<dyn Snapshotable>,
    transport: Arc<dyn Transport>,
    config: ServerConfig,

    mailbox_rx: mpsc::Receiver<Message>,
    mailbox_tx: mpsc::Sender<Message>,
    command_rx: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    shutdown_rx: mpsc::Receiver<()>,
    shutdown_tx: mpsc::Sender<()>,

    /// Per-peer FIFO queues feeding the sender tasks
    peer_queues: HashMap<u64, mpsc::UnboundedSender<Message>>,

    /// Proposals waiting for their entry to apply: index -> (term, reply)
    pending_proposals: HashMap<u64, (u64, oneshot::Sender<Result<String, RaftError>>)>,
    /// Read-index calls waiting for an answer, keyed by context. The
    /// recorded term bounds how long we wait: a leadership change
    /// invalidates the request.
    pending_reads: HashMap<Vec<u8>, (u64, oneshot::Sender<Result<u64, RaftError>>)>,
    read_ctx_counter: u64,

    persisted_hard_state: HardState,
    /// What the log looked like at the last persist
    persisted_log: (u64, u64, u64), // (first, last, last_term)
    applied_since_snapshot: u64,
}

impl RaftServer {
    /// Build a server around a fresh or restarted node. Durable state
    /// is loaded from `storage` and pushed into the core; the returned
    /// mailbox sender is what the transport's receiving side feeds.
    pub fn new<T: Transport + 'static>(
        config: ServerConfig,
        transport: T,
        mut storage: Box<dyn Storage>,
        mut state_machine: Box<dyn Snapshotable>,
    ) -> Result<(Self, mpsc::Sender<Message>), RaftError> {
        let outbox = Outbox::default();
        let mut core = RaftCore::new(&config.raft, Box::new(outbox.clone()))?;

        let hard_state = storage.load_hard_state()?;
        let snapshot = storage.load_snapshot()?;
        let entries = storage.load_log()?;
        let snapshot_meta = snapshot
            .as_ref()
            .map(|s| s.metadata)
            .unwrap_or(SnapshotMetadata::default());
        if let Some(snapshot) = snapshot {
            state_machine
                .restore(&snapshot.data)
                .map_err(StorageError::Corruption)?;
            outbox.set_available(Some(snapshot));
        }
        if hard_state != HardState::default() || snapshot_meta.index > 0 || !entries.is_empty() {
            info!(
                "{} restarting at term {} with {} log entries (snapshot at {})",
                config.raft.id,
                hard_state.term,
                entries.len(),
                snapshot_meta.index
            );
            core.load(hard_state, snapshot_meta, entries);
        }

        let persisted_log = (
            core.log().first_index(),
            core.log().last_index(),
            core.log().last_term(),
        );

        let (mailbox_tx, mailbox_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(32);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = RaftServer {
            core,
            outbox,
            storage,
            state_machine,
            transport: Arc::new(transport),
            config,
            mailbox_rx,
            mailbox_tx: mailbox_tx.clone(),
            command_rx,
            command_tx,
            shutdown_rx,
            shutdown_tx,
            peer_queues: HashMap::new(),
            pending_proposals: HashMap::new(),
            pending_reads: HashMap::new(),
            read_ctx_counter: 0,
            persisted_hard_state: hard_state,
            persisted_log,
            applied_since_snapshot: 0,
        };
        Ok((server, mailbox_tx))
    }

    /// Spawn the server loop and return the client handle.
    pub fn start(self) -> RaftHandle {
        let handle = RaftHandle {
            command_tx: self.command_tx.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        };
        tokio::spawn(self.run());
        handle
    }

    async fn run(mut self) {
        // Per-peer sender tasks live for the whole server lifetime.
        self.peer_queues = self
            .config
            .raft
            .peers
            .iter()
            .map(|&peer| {
                (peer, spawn_peer_sender(peer, Arc::clone(&self.transport), self.mailbox_tx.clone()))
            })
            .collect();

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                Some(msg) = self.mailbox_rx.recv() => {
                    self.core.step(msg);
                }
                Some(cmd) = self.command_rx.recv() => {
                    self.handle_command(cmd);
                }
                _ = ticker.tick() => {
                    self.core.tick();
                }
                else => break,
            }

            if let Err(e) = self.flush() {
                // A node that cannot persist must stop participating.
                error!("{} flush failed, shutting down: {}", self.core.id(), e);
                break;
            }
        }
        debug!("{} server loop exited", self.core.id());
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Propose { data, reply } => {
                if let Err(e) = self.state_machine.validate(&data) {
                    let _ = reply.send(Err(RaftError::StateMachine(e)));
                    return;
                }
                match self.core.propose(data) {
                    Ok((index, term)) => {
                        self.pending_proposals.insert(index, (term, reply));
                    }
                    Err(ProposeError::NotLeader { leader, .. }) => {
                        let _ = reply.send(Err(RaftError::NotLeader { leader_hint: leader }));
                    }
                }
            }
            Command::ReadIndex { reply } => {
                self.read_ctx_counter += 1;
                let mut ctx = Vec::with_capacity(16);
                ctx.extend_from_slice(&self.core.id().to_be_bytes());
                ctx.extend_from_slice(&self.read_ctx_counter.to_be_bytes());
                match self.core.read_index(ctx.clone()) {
                    Ok(()) => {
                        self.pending_reads.insert(ctx, (self.core.term(), reply));
                    }
                    Err(ProposeError::NotLeader { leader, .. }) => {
                        let _ = reply.send(Err(RaftError::NotLeader { leader_hint: leader }));
                    }
                }
            }
            Command::Status { reply } => {
                let _ = reply.send(Status {
                    id: self.core.id(),
                    role: self.core.role(),
                    term: self.core.term(),
                    leader_id: self.core.leader_id(),
                    commit_index: self.core.log().commit_index(),
                    applied: self.core.log().applied(),
                    last_log_index: self.core.log().last_index(),
                });
            }
        }
    }

    /// Persist, apply, resolve waiters, then ship messages. Durability
    /// strictly precedes any outbound message from this batch.
    fn flush(&mut self) -> Result<(), StorageError> {
        let effects = self.outbox.drain();

        // Durable state first.
        let hard_state = self.core.hard_state();
        if hard_state != self.persisted_hard_state {
            self.storage.save_hard_state(hard_state)?;
            self.persisted_hard_state = hard_state;
        }

        for snapshot in &effects.installed {
            self.state_machine
                .restore(&snapshot.data)
                .map_err(StorageError::Corruption)?;
            self.storage.save_snapshot(snapshot)?;
            self.outbox.set_available(Some(snapshot.clone()));
            self.applied_since_snapshot = 0;
        }

        // Apply committed entries and settle waiting proposals.
        for entry in &effects.applied {
            let result = self.state_machine.apply(&entry.data);
            self.applied_since_snapshot += 1;
            if let Err(ref e) = result {
                debug!("{} entry {} refused by state machine: {}", self.core.id(), entry.index, e);
            }
            if let Some((term, reply)) = self.pending_proposals.remove(&entry.index) {
                if entry.term == term {
                    let _ = reply.send(result.map_err(RaftError::StateMachine));
                } else {
                    let _ = reply.send(Err(RaftError::NotCommitted));
                }
            }
        }

        self.maybe_take_snapshot()?;

        // Persist the log suffix once it differs from what is on disk.
        let log_shape = (
            self.core.log().first_index(),
            self.core.log().last_index(),
            self.core.log().last_term(),
        );
        if log_shape != self.persisted_log {
            let entries = self.core.log().entries_from(self.core.log().first_index());
            self.storage.save_log(entries)?;
            self.persisted_log = log_shape;
        }

        for read_state in effects.read_states {
            if let Some((_, reply)) = self.pending_reads.remove(&read_state.request_ctx) {
                let _ = reply.send(Ok(read_state.index));
            }
        }

        // Waiters that can no longer be settled fail now so callers can
        // retry against the current leader: proposals when this node
        // lost leadership, reads when the term their leader served in
        // is over.
        let hint = self.core.leader_id();
        if self.core.role() != Role::Leader && !self.pending_proposals.is_empty() {
            for (_, (_, reply)) in self.pending_proposals.drain() {
                let _ = reply.send(Err(RaftError::NotLeader { leader_hint: hint }));
            }
        }
        let term = self.core.term();
        let expired: Vec<Vec<u8>> = self
            .pending_reads
            .iter()
            .filter(|(_, (read_term, _))| *read_term < term)
            .map(|(ctx, _)| ctx.clone())
            .collect();
        for ctx in expired {
            if let Some((_, reply)) = self.pending_reads.remove(&ctx) {
                let _ = reply.send(Err(RaftError::NotLeader { leader_hint: hint }));
            }
        }

        // Everything durable; the messages may go out.
        for msg in effects.messages {
            match self.peer_queues.get(&msg.to) {
                Some(queue) => {
                    let _ = queue.send(msg);
                }
                None => warn!("{} has no route to {}", self.core.id(), msg.to),
            }
        }
        Ok(())
    }

    /// Snapshot the state machine and compact the log once enough
    /// entries have been applied since the last snapshot.
    fn maybe_take_snapshot(&mut self) -> Result<(), StorageError> {
        if self.config.snapshot_threshold == 0
            || self.applied_since_snapshot < self.config.snapshot_threshold
        {
            return Ok(());
        }
        let applied = self.core.log().applied();
        let data = match self.state_machine.snapshot() {
            Ok(data) => data,
            Err(e) => {
                // Not fatal; try again after the next batch.
                warn!("{} snapshot failed: {}", self.core.id(), e);
                return Ok(());
            }
        };
        let snapshot = Snapshot {
            metadata: SnapshotMetadata { index: applied, term: self.core.log().term(applied) },
            data,
        };
        self.storage.save_snapshot(&snapshot)?;
        self.core.compact(applied);
        self.outbox.set_available(Some(snapshot));
        self.applied_since_snapshot = 0;
        info!("{} compacted log through {}", self.core.id(), applied);
        Ok(())
    }
}

/// One forwarding task per peer keeps the wire order of that peer's
/// messages. A failed send becomes a synthetic `Unreachable` for the
/// core.
fn spawn_peer_sender(
    peer: u64,
    transport: Arc<dyn Transport>,
    mailbox: mpsc::Sender<Message>,
) -> mpsc::UnboundedSender<Message> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = transport.send(peer, msg).await {
                debug!("send to {} failed: {}", peer, e);
                let mut unreachable = Message::new(MessageKind::Unreachable, 0);
                unreachable.from = peer;
                if mailbox.send(unreachable).await.is_err() {
                    break;
                }
            }
        }
    });
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::kv::{KeyValueStore, SharedKvStore};
    use crate::storage::MemoryStorage;
    use crate::transport::inmemory::InMemoryNetwork;

    /// Storage that survives a server restart within one test.
    #[derive(Clone, Default)]
    struct SharedStorage(Arc<Mutex<MemoryStorage>>);

    impl Storage for SharedStorage {
        fn load_hard_state(&self) -> Result<HardState, StorageError> {
            self.0.lock().unwrap().load_hard_state()
        }

        fn save_hard_state(&mut self, hard_state: HardState) -> Result<(), StorageError> {
            self.0.lock().unwrap().save_hard_state(hard_state)
        }

        fn load_log(&self) -> Result<Vec<Entry>, StorageError> {
            self.0.lock().unwrap().load_log()
        }

        fn save_log(&mut self, entries: &[Entry]) -> Result<(), StorageError> {
            self.0.lock().unwrap().save_log(entries)
        }

        fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
            self.0.lock().unwrap().load_snapshot()
        }

        fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
            self.0.lock().unwrap().save_snapshot(snapshot)
        }
    }

    fn single_node_config(id: u64) -> ServerConfig {
        ServerConfig::new(RaftConfig::new(id, vec![]).with_randomize_timeout(false))
            .with_tick_interval(Duration::from_millis(5))
    }

    async fn start_single_node() -> (RaftHandle, SharedKvStore) {
        let network = InMemoryNetwork::new();
        let kv: SharedKvStore = Arc::new(Mutex::new(KeyValueStore::new()));
        let (server, _mailbox) = RaftServer::new(
            single_node_config(1),
            network.transport(1),
            Box::new(MemoryStorage::new()),
            Box::new(kv.clone()),
        )
        .unwrap();
        let handle = server.start();

        // Wait for self-election.
        for _ in 0..100 {
            if handle.status().await.unwrap().role == Role::Leader {
                return (handle, kv);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("single node failed to elect itself");
    }

    #[tokio::test]
    async fn test_propose_and_read_on_single_node() {
        let (handle, kv) = start_single_node().await;

        handle.propose(b"SET name alice".to_vec()).await.unwrap();
        assert_eq!(kv.lock().unwrap().get("name"), Some("alice".to_string()));

        let read_index = handle.read_index().await.unwrap();
        let status = handle.status().await.unwrap();
        assert!(status.applied >= read_index);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_command_rejected_before_proposing() {
        let (handle, _kv) = start_single_node().await;
        let err = handle.propose(b"FROB x".to_vec()).await.unwrap_err();
        assert!(matches!(err, RaftError::StateMachine(_)));

        let status = handle.status().await.unwrap();
        // Only the election no-op is in the log.
        assert_eq!(status.last_log_index, 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_propose_without_leader_fails() {
        let network = InMemoryNetwork::new();
        let kv: SharedKvStore = Arc::new(Mutex::new(KeyValueStore::new()));
        // Peer 2 does not exist, so this node can never win an election.
        let config = ServerConfig::new(
            RaftConfig::new(1, vec![2]).with_randomize_timeout(false),
        )
        .with_tick_interval(Duration::from_millis(5));
        let (server, _mailbox) = RaftServer::new(
            config,
            network.transport(1),
            Box::new(MemoryStorage::new()),
            Box::new(kv.clone()),
        )
        .unwrap();
        let handle = server.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = handle.propose(b"SET a 1".to_vec()).await.unwrap_err();
        assert!(matches!(err, RaftError::NotLeader { .. }));
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_recovers_state_from_storage() {
        let network = InMemoryNetwork::new();
        let storage = SharedStorage::default();
        let kv: SharedKvStore = Arc::new(Mutex::new(KeyValueStore::new()));
        let (server, _mailbox) = RaftServer::new(
            single_node_config(1),
            network.transport(1),
            Box::new(storage.clone()),
            Box::new(kv.clone()),
        )
        .unwrap();
        let handle = server.start();
        for _ in 0..100 {
            if handle.status().await.unwrap().role == Role::Leader {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.propose(b"SET k v".to_vec()).await.unwrap();
        let term_before = handle.status().await.unwrap().term;
        handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let kv2: SharedKvStore = Arc::new(Mutex::new(KeyValueStore::new()));
        let (server2, _mailbox2) = RaftServer::new(
            single_node_config(1),
            network.transport(1),
            Box::new(storage),
            Box::new(kv2.clone()),
        )
        .unwrap();
        let handle2 = server2.start();
        for _ in 0..100 {
            let status = handle2.status().await.unwrap();
            if status.role == Role::Leader && status.applied >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let status = handle2.status().await.unwrap();
        assert!(status.term >= term_before);
        assert_eq!(kv2.lock().unwrap().get("k"), Some("v".to_string()));
        handle2.shutdown().await;
    }
}
