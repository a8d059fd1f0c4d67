//! Key/value persistence capability.
//!
//! The queue treats its backing store as an abstract string-valued
//! key/value capability with best-effort durability. Quota exhaustion is
//! a first-class error so the queue can shrink and retry instead of
//! losing its whole snapshot.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

/// Errors a backing store may report.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store refused the write for lack of space.
    #[error("storage quota exceeded")]
    QuotaExceeded,

    /// Any other backend failure; non-fatal to the runtime.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Synchronous string-valued key/value store.
pub trait KeyValueStore: Send + Sync {
    /// Read the value under `key`, if present.
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
    /// Write `value` under `key`.
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    /// Delete `key`; absent keys are not an error.
    fn remove(&self, key: &str) -> StoreResult<()>;
}

/// In-memory store, optionally capacity-limited.
///
/// The byte capacity makes quota handling testable: a `set` whose value
/// pushes the total stored bytes past the limit fails with
/// [`StoreError::QuotaExceeded`].
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    max_bytes: Option<usize>,
}

impl MemoryStore {
    /// Unbounded in-memory store.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_bytes: None,
        }
    }

    /// Store that rejects writes once total stored bytes would exceed
    /// `max_bytes`.
    pub fn with_capacity(max_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_bytes: Some(max_bytes),
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(max) = self.max_bytes {
            let others: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if others + key.len() + value.len() > max {
                return Err(StoreError::QuotaExceeded);
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}
