//! Persistence abstraction for durable node state
//!
//! The consensus rules require term, vote, and the log suffix to be
//! durable before any message that reflects them leaves the host. The
//! core never touches storage itself; the host persists through this
//! trait during its flush phase, before handing messages to the
//! transport.

use thiserror::Error;

use crate::core::message::{Entry, HardState, Snapshot};

pub mod memory;

pub use memory::MemoryStorage;

/// Errors surfaced by a storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("data corruption: {0}")]
    Corruption(String),
}

/// Durable store for one node's consensus state.
///
/// Implementations must ensure every `save_*` call is durable before
/// returning; the host's correctness argument leans on that.
pub trait Storage: Send {
    /// Load the persisted term and vote; defaults on first boot.
    fn load_hard_state(&self) -> Result<HardState, StorageError>;

    fn save_hard_state(&mut self, hard_state: HardState) -> Result<(), StorageError>;

    /// Load the persisted log suffix (entries after the snapshot).
    fn load_log(&self) -> Result<Vec<Entry>, StorageError>;

    /// Replace the persisted log suffix. The host hands over the whole
    /// live suffix; conflict truncation is implicit in the replacement.
    fn save_log(&mut self, entries: &[Entry]) -> Result<(), StorageError>;

    /// Load the most recent snapshot, if any.
    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError>;

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError>;
}
