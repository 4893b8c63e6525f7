//! Simple key-value store state machine
//!
//! Commands (state-changing operations that go through the log):
//! - `SET key value` - set a key, returns Ok("")
//! - `DELETE key` - delete a key, returns Ok("") or Err("NOT_FOUND")
//!
//! Reads go through `get()` directly; pair it with `read_index` for
//! linearizability.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::{ApplyResult, Snapshotable, StateMachine};

/// Simple in-memory key-value store.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeyValueStore {
    data: HashMap<String, String>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        KeyValueStore { data: HashMap::new() }
    }

    /// Read a value directly (bypasses the log).
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    pub fn all(&self) -> HashMap<String, String> {
        self.data.clone()
    }
}

/// Shared handle usable both as the replicated state machine and for
/// direct reads from the serving layer.
pub type SharedKvStore = Arc<Mutex<KeyValueStore>>;

impl StateMachine for SharedKvStore {
    fn validate(&self, command: &[u8]) -> Result<(), String> {
        self.lock().unwrap().validate(command)
    }

    fn apply(&mut self, command: &[u8]) -> ApplyResult {
        self.lock().unwrap().apply(command)
    }
}

impl Snapshotable for SharedKvStore {
    fn snapshot(&self) -> Result<Vec<u8>, String> {
        self.lock().unwrap().snapshot()
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        self.lock().unwrap().restore(data)
    }
}

impl StateMachine for KeyValueStore {
    fn validate(&self, command: &[u8]) -> Result<(), String> {
        // Leader no-ops are always fine.
        if command.is_empty() {
            return Ok(());
        }
        let text = std::str::from_utf8(command).map_err(|_| "command is not utf-8".to_string())?;
        let parts: Vec<&str> = text.splitn(3, ' ').collect();
        match parts.as_slice() {
            ["SET", _key, _value] => Ok(()),
            ["DELETE", _key] => Ok(()),
            _ => Err(format!("unknown command: {}", text)),
        }
    }

    fn apply(&mut self, command: &[u8]) -> ApplyResult {
        if command.is_empty() {
            return Ok(String::new());
        }
        let text = std::str::from_utf8(command).map_err(|_| "command is not utf-8".to_string())?;
        let parts: Vec<&str> = text.splitn(3, ' ').collect();
        match parts.as_slice() {
            ["SET", key, value] => {
                self.data.insert(key.to_string(), value.to_string());
                Ok(String::new())
            }
            ["DELETE", key] => match self.data.remove(*key) {
                Some(_) => Ok(String::new()),
                None => Err("NOT_FOUND".to_string()),
            },
            _ => Err(format!("unknown command: {}", text)),
        }
    }
}

impl Snapshotable for KeyValueStore {
    fn snapshot(&self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(self).map_err(|e| format!("kv snapshot failed: {}", e))
    }

    fn restore(&mut self, data: &[u8]) -> Result<(), String> {
        *self = serde_json::from_slice(data).map_err(|e| format!("kv restore failed: {}", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut kv = KeyValueStore::new();
        kv.apply(b"SET name alice").unwrap();
        assert_eq!(kv.get("name"), Some("alice".to_string()));
    }

    #[test]
    fn test_set_value_with_spaces() {
        let mut kv = KeyValueStore::new();
        kv.apply(b"SET greeting hello there world").unwrap();
        assert_eq!(kv.get("greeting"), Some("hello there world".to_string()));
    }

    #[test]
    fn test_delete() {
        let mut kv = KeyValueStore::new();
        kv.apply(b"SET k v").unwrap();
        assert!(kv.apply(b"DELETE k").is_ok());
        assert_eq!(kv.get("k"), None);
        assert_eq!(kv.apply(b"DELETE k"), Err("NOT_FOUND".to_string()));
    }

    #[test]
    fn test_noop_is_accepted() {
        let mut kv = KeyValueStore::new();
        assert_eq!(kv.apply(b""), Ok(String::new()));
        assert!(kv.validate(b"").is_ok());
    }

    #[test]
    fn test_validate_rejects_garbage() {
        let kv = KeyValueStore::new();
        assert!(kv.validate(b"FROB k").is_err());
        assert!(kv.validate(b"SET onlykey").is_err());
    }

    #[test]
    fn test_snapshot_restore() {
        let mut kv = KeyValueStore::new();
        kv.apply(b"SET a 1").unwrap();
        kv.apply(b"SET b 2").unwrap();
        let data = kv.snapshot().unwrap();

        let mut restored = KeyValueStore::new();
        restored.restore(&data).unwrap();
        assert_eq!(restored.get("a"), Some("1".to_string()));
        assert_eq!(restored.get("b"), Some("2".to_string()));
    }
}
