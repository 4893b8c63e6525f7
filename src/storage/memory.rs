//! In-memory storage
//!
//! No disk I/O, nothing survives a process restart. Useful for tests
//! and for deployments that accept losing a node's durable state.

use crate::core::message::{Entry, HardState, Snapshot};

use super::{Storage, StorageError};

/// Storage backend that keeps everything in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    hard_state: HardState,
    log: Vec<Entry>,
    snapshot: Option<Snapshot>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }
}

impl Storage for MemoryStorage {
    fn load_hard_state(&self) -> Result<HardState, StorageError> {
        Ok(self.hard_state)
    }

    fn save_hard_state(&mut self, hard_state: HardState) -> Result<(), StorageError> {
        self.hard_state = hard_state;
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<Entry>, StorageError> {
        Ok(self.log.clone())
    }

    fn save_log(&mut self, entries: &[Entry]) -> Result<(), StorageError> {
        self.log = entries.to_vec();
        Ok(())
    }

    fn load_snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.snapshot.clone())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }
}
