//! Sliding-window duplicate suppression.
//!
//! Each message derives one or two keys per the configured strategy:
//! `id:<id-field>` when the message carries an id, and `hash:<djb2>`
//! over its serialization. A message is a duplicate when any derived
//! key is already recorded. A periodic sweep at half the window width
//! evicts expired records; capacity pressure evicts the oldest record
//! before an insert.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::id::now_millis;

/// Which keys identify a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupStrategy {
    /// Only the message's `id` field.
    Id,
    /// Only the content hash.
    Hash,
    /// Either one matching marks a duplicate.
    Both,
}

/// Deduplication window configuration.
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// How long a record suppresses repeats.
    pub window: Duration,
    /// Maximum retained records.
    pub capacity: usize,
    pub strategy: DedupStrategy,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            capacity: 1_000,
            strategy: DedupStrategy::Both,
        }
    }
}

/// Sliding-window duplicate detector.
pub struct Deduplicator {
    config: DedupConfig,
    records: Arc<Mutex<HashMap<String, u64>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Deduplicator {
    /// Create a detector; call [`start_sweeper`](Self::start_sweeper)
    /// to begin periodic eviction.
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            records: Arc::new(Mutex::new(HashMap::new())),
            sweeper: Mutex::new(None),
        }
    }

    fn keys(&self, message: &Value) -> Vec<String> {
        let mut keys = Vec::with_capacity(2);
        if matches!(self.config.strategy, DedupStrategy::Id | DedupStrategy::Both) {
            if let Some(id) = message.get("id").and_then(Value::as_str) {
                keys.push(format!("id:{id}"));
            }
        }
        if matches!(self.config.strategy, DedupStrategy::Hash | DedupStrategy::Both) {
            let text = serde_json::to_string(message).unwrap_or_default();
            keys.push(format!("hash:{}", djb2(text.as_bytes())));
        }
        keys
    }

    /// Whether any of the message's keys is already recorded and still
    /// inside the window.
    pub fn is_duplicate(&self, message: &Value) -> bool {
        let cutoff = now_millis().saturating_sub(self.config.window.as_millis() as u64);
        let records = self.records.lock().unwrap();
        self.keys(message)
            .iter()
            .any(|key| records.get(key).is_some_and(|&at| at >= cutoff))
    }

    /// Record the message's keys at the current timestamp.
    pub fn mark_processed(&self, message: &Value) {
        let now = now_millis();
        let mut records = self.records.lock().unwrap();
        for key in self.keys(message) {
            while records.len() >= self.config.capacity && !records.contains_key(&key) {
                // Oldest record goes first.
                let oldest = records
                    .iter()
                    .min_by_key(|(_, &at)| at)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(k) => records.remove(&k),
                    None => break,
                };
            }
            records.insert(key, now);
        }
    }

    /// Start the periodic sweep at half the window width. A running
    /// sweeper is restarted.
    pub fn start_sweeper(&self) {
        self.stop_sweeper();
        let records = self.records.clone();
        let window = self.config.window;
        let period = (window / 2).max(Duration::from_millis(10));
        *self.sweeper.lock().unwrap() = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let cutoff = now_millis().saturating_sub(window.as_millis() as u64);
                let mut records = records.lock().unwrap();
                let before = records.len();
                records.retain(|_, &mut at| at >= cutoff);
                let evicted = before - records.len();
                if evicted > 0 {
                    tracing::trace!(evicted, "dedup sweep evicted expired records");
                }
            }
        }));
    }

    /// Stop the periodic sweep.
    pub fn stop_sweeper(&self) {
        if let Some(task) = self.sweeper.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Retained record count.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Whether no records are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}

impl Drop for Deduplicator {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

/// djb2 over raw bytes.
fn djb2(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(window_ms: u64, capacity: usize, strategy: DedupStrategy) -> DedupConfig {
        DedupConfig {
            window: Duration::from_millis(window_ms),
            capacity,
            strategy,
        }
    }

    #[test]
    fn test_mark_then_duplicate() {
        let dedup = Deduplicator::new(DedupConfig::default());
        let message = json!({"id": "m1", "v": 1});

        assert!(!dedup.is_duplicate(&message));
        dedup.mark_processed(&message);
        assert!(dedup.is_duplicate(&message));
    }

    #[test]
    fn test_id_strategy_matches_same_id_different_body() {
        let dedup = Deduplicator::new(config(60_000, 100, DedupStrategy::Id));
        dedup.mark_processed(&json!({"id": "m1", "v": 1}));
        assert!(dedup.is_duplicate(&json!({"id": "m1", "v": 999})));
        assert!(!dedup.is_duplicate(&json!({"id": "m2", "v": 1})));
    }

    #[test]
    fn test_hash_strategy_matches_identical_content() {
        let dedup = Deduplicator::new(config(60_000, 100, DedupStrategy::Hash));
        dedup.mark_processed(&json!({"v": 1}));
        assert!(dedup.is_duplicate(&json!({"v": 1})));
        assert!(!dedup.is_duplicate(&json!({"v": 2})));
    }

    #[test]
    fn test_id_strategy_ignores_idless_messages() {
        let dedup = Deduplicator::new(config(60_000, 100, DedupStrategy::Id));
        dedup.mark_processed(&json!({"v": 1}));
        // No id, no keys: nothing recorded, nothing duplicated.
        assert!(!dedup.is_duplicate(&json!({"v": 1})));
        assert!(dedup.is_empty());
    }

    #[tokio::test]
    async fn test_window_expiry() {
        let dedup = Deduplicator::new(config(30, 100, DedupStrategy::Both));
        let message = json!({"id": "m1"});
        dedup.mark_processed(&message);
        assert!(dedup.is_duplicate(&message));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!dedup.is_duplicate(&message));
    }

    #[tokio::test]
    async fn test_sweeper_evicts_expired_records() {
        let dedup = Deduplicator::new(config(30, 100, DedupStrategy::Both));
        dedup.mark_processed(&json!({"id": "m1"}));
        assert!(!dedup.is_empty());

        dedup.start_sweeper();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(dedup.is_empty());
        dedup.stop_sweeper();
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let dedup = Deduplicator::new(config(60_000, 3, DedupStrategy::Hash));
        for i in 0..5 {
            dedup.mark_processed(&json!({ "n": i }));
        }
        assert_eq!(dedup.len(), 3);
        // The most recent records survive.
        assert!(dedup.is_duplicate(&json!({"n": 4})));
    }

    #[test]
    fn test_clear() {
        let dedup = Deduplicator::new(DedupConfig::default());
        dedup.mark_processed(&json!({"id": "m1"}));
        dedup.clear();
        assert!(dedup.is_empty());
    }

    #[test]
    fn test_djb2_stable() {
        assert_eq!(djb2(b""), 5381);
        assert_eq!(djb2(b"a"), djb2(b"a"));
        assert_ne!(djb2(b"a"), djb2(b"b"));
    }
}
