//! In-memory transport for tests
//!
//! All nodes register with a shared [`InMemoryNetwork`]; each gets an
//! mpsc mailbox. Disconnecting a node drops traffic in both directions,
//! which is how the tests cut nodes off without tearing them down.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::message::Message;

use super::{Transport, TransportError};

const MAILBOX_DEPTH: usize = 256;

/// Shared switchboard connecting every node's mailbox.
#[derive(Default)]
pub struct InMemoryNetwork {
    inner: Mutex<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    senders: HashMap<u64, mpsc::Sender<Message>>,
    disconnected: HashSet<u64>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(InMemoryNetwork::default())
    }

    /// Register a node and return its mailbox receiver.
    pub fn register(self: &Arc<Self>, id: u64) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(MAILBOX_DEPTH);
        self.inner.lock().unwrap().senders.insert(id, tx);
        rx
    }

    /// Create the sending side for one node.
    pub fn transport(self: &Arc<Self>, id: u64) -> InMemoryTransport {
        InMemoryTransport { network: Arc::clone(self), local: id }
    }

    /// Cut a node off from the network in both directions.
    pub fn disconnect(&self, id: u64) {
        self.inner.lock().unwrap().disconnected.insert(id);
    }

    /// Reattach a node.
    pub fn connect(&self, id: u64) {
        self.inner.lock().unwrap().disconnected.remove(&id);
    }

    pub fn is_connected(&self, id: u64) -> bool {
        !self.inner.lock().unwrap().disconnected.contains(&id)
    }

    fn sender_for(&self, from: u64, target: u64) -> Result<mpsc::Sender<Message>, TransportError> {
        let inner = self.inner.lock().unwrap();
        if inner.disconnected.contains(&from) || inner.disconnected.contains(&target) {
            return Err(TransportError::ConnectionFailed);
        }
        inner.senders.get(&target).cloned().ok_or(TransportError::NodeNotFound)
    }
}

/// The sending half handed to one node's host.
pub struct InMemoryTransport {
    network: Arc<InMemoryNetwork>,
    local: u64,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, target: u64, msg: Message) -> Result<(), TransportError> {
        let sender = self.network.sender_for(self.local, target)?;
        sender.send(msg).await.map_err(|_| TransportError::ConnectionFailed)
    }
}
