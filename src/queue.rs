//! Priority-ordered, bounded, optionally persistent outbox.
//!
//! Three bands (`High > Normal > Low`), FIFO within a band. Sorting is
//! deferred: every enqueue flips an `is_sorted` flag and order-dependent
//! reads re-sort on demand, so bulk enqueues cost one sort instead of n.
//!
//! With persistence enabled every mutation mirrors the queue into the
//! configured [`KeyValueStore`]; restore at construction drops entries
//! older than [`ENTRY_EXPIRY`]. Quota exhaustion evicts half the low
//! band and retries once before degrading to memory-only for the rest
//! of the session.

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::QueueConfig;
use crate::error::{Result, WireError};
use crate::id::{now_millis, IdGenerator};
use crate::storage::{KeyValueStore, StoreError};
use crate::BoxFuture;

/// Queued entries older than this are dropped on restore.
pub const ENTRY_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Outbound priority band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// One buffered outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub payload: Value,
    pub priority: Priority,
    /// Milliseconds since the Unix epoch at first enqueue. Preserved on
    /// re-enqueue so a failed flush keeps its place in the band.
    pub enqueued_at: u64,
    pub retries: u32,
    /// Tie-break for items enqueued within the same millisecond.
    #[serde(default)]
    seq: u64,
    /// Serialized-size estimate; recomputed on restore.
    #[serde(skip)]
    bytes: usize,
}

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub len: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub total_bytes: usize,
    /// Whether mutations are still mirrored into the store.
    pub persistent: bool,
}

/// Priority outbox for messages that cannot go to the wire yet.
pub struct MessageQueue {
    config: QueueConfig,
    items: Vec<QueueItem>,
    is_sorted: bool,
    total_bytes: usize,
    next_seq: u64,
    ids: IdGenerator,
    store: Option<Arc<dyn KeyValueStore>>,
    /// Set once persistence failed hard; the queue keeps working in
    /// memory for the rest of the session.
    memory_only: bool,
}

impl MessageQueue {
    /// Create a queue; with `persistent` set and a store provided, any
    /// prior snapshot under the storage key is restored.
    pub fn new(config: QueueConfig, store: Option<Arc<dyn KeyValueStore>>) -> Self {
        let mut queue = Self {
            items: Vec::new(),
            is_sorted: true,
            total_bytes: 0,
            next_seq: 0,
            ids: IdGenerator::new(),
            store: if config.persistent { store } else { None },
            memory_only: false,
            config,
        };
        queue.restore();
        queue
    }

    /// Buffer a payload. Returns the assigned item id.
    ///
    /// Fails with [`WireError::MessageSize`] when the serialized payload
    /// exceeds the per-message cap, and with [`WireError::QueueFull`]
    /// only when the capacity is zero and nothing can be evicted.
    pub fn enqueue(&mut self, payload: Value, priority: Priority) -> Result<String> {
        let bytes = estimate_size(&payload);
        if bytes > self.config.max_message_bytes {
            return Err(WireError::MessageSize {
                size: bytes,
                limit: self.config.max_message_bytes,
            });
        }

        let id = self.ids.next("q");
        let item = QueueItem {
            id: id.clone(),
            payload,
            priority,
            enqueued_at: now_millis(),
            retries: 0,
            seq: self.next_seq,
            bytes,
        };
        self.next_seq += 1;
        self.insert(item)?;
        self.persist();
        Ok(id)
    }

    /// Put a flushed-but-failed item back with its original priority
    /// and timestamp, bumping its retry count.
    pub fn requeue(&mut self, mut item: QueueItem) -> Result<()> {
        item.retries += 1;
        item.bytes = estimate_size(&item.payload);
        self.insert(item)?;
        self.persist();
        Ok(())
    }

    fn insert(&mut self, item: QueueItem) -> Result<()> {
        while self.items.len() >= self.config.max_size {
            // Oldest item of the lowest present band goes first, even
            // when the newcomer itself is the lowest band.
            let victim = self
                .items
                .iter()
                .enumerate()
                .min_by_key(|(_, it)| (it.priority, it.enqueued_at, it.seq))
                .map(|(idx, _)| idx);
            match victim {
                Some(idx) => {
                    let dropped = self.items.remove(idx);
                    self.total_bytes -= dropped.bytes;
                    tracing::debug!(id = %dropped.id, priority = ?dropped.priority, "queue full, dropped oldest item");
                }
                None => {
                    return Err(WireError::QueueFull(format!(
                        "capacity {} leaves no room",
                        self.config.max_size
                    )))
                }
            }
        }
        self.total_bytes += item.bytes;
        self.items.push(item);
        self.is_sorted = false;
        Ok(())
    }

    fn ensure_sorted(&mut self) {
        if !self.is_sorted {
            self.items
                .sort_by_key(|it| (Reverse(it.priority), it.enqueued_at, it.seq));
            self.is_sorted = true;
        }
    }

    /// Remove and return the highest-band, oldest item.
    pub fn dequeue(&mut self) -> Option<QueueItem> {
        self.ensure_sorted();
        if self.items.is_empty() {
            return None;
        }
        let item = self.items.remove(0);
        self.total_bytes -= item.bytes;
        self.persist();
        Some(item)
    }

    /// The item [`dequeue`](Self::dequeue) would return, without removal.
    pub fn peek(&mut self) -> Option<&QueueItem> {
        self.ensure_sorted();
        self.items.first()
    }

    /// Remove and return up to `n` items in dequeue order.
    pub fn dequeue_batch(&mut self, n: usize) -> Vec<QueueItem> {
        self.ensure_sorted();
        let take = n.min(self.items.len());
        let batch: Vec<QueueItem> = self.items.drain(..take).collect();
        self.total_bytes -= batch.iter().map(|it| it.bytes).sum::<usize>();
        if !batch.is_empty() {
            self.persist();
        }
        batch
    }

    /// Drain the queue through `send`, one item at a time.
    ///
    /// A failed send re-enqueues that item with `retries + 1` at its
    /// original priority and stops the flush. Returns how many items
    /// were delivered.
    pub async fn flush<F>(&mut self, mut send: F) -> usize
    where
        F: FnMut(Value) -> BoxFuture<'static, Result<()>>,
    {
        let mut delivered = 0;
        while let Some(item) = self.dequeue() {
            match send(item.payload.clone()).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::debug!(%err, id = %item.id, "flush send failed, re-enqueueing");
                    if let Err(err) = self.requeue(item) {
                        tracing::warn!(%err, "could not re-enqueue after failed flush");
                    }
                    break;
                }
            }
        }
        delivered
    }

    /// Drop every queued item.
    pub fn clear(&mut self) {
        self.items.clear();
        self.total_bytes = 0;
        self.is_sorted = true;
        if let Some(store) = &self.store {
            if !self.memory_only {
                if let Err(err) = store.remove(&self.config.storage_key) {
                    tracing::warn!(%err, "failed to clear persisted queue");
                }
            }
        }
    }

    /// Look up a queued item by id.
    pub fn find_by_id(&self, id: &str) -> Option<&QueueItem> {
        self.items.iter().find(|it| it.id == id)
    }

    /// Remove a queued item by id. Returns whether it was present.
    pub fn remove_by_id(&mut self, id: &str) -> bool {
        match self.items.iter().position(|it| it.id == id) {
            Some(idx) => {
                let item = self.items.remove(idx);
                self.total_bytes -= item.bytes;
                self.persist();
                true
            }
            None => false,
        }
    }

    /// Every queued item, in dequeue order.
    pub fn get_all(&mut self) -> &[QueueItem] {
        self.ensure_sorted();
        &self.items
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the queue holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> QueueStats {
        let count = |p: Priority| self.items.iter().filter(|it| it.priority == p).count();
        QueueStats {
            len: self.items.len(),
            high: count(Priority::High),
            normal: count(Priority::Normal),
            low: count(Priority::Low),
            total_bytes: self.total_bytes,
            persistent: self.store.is_some() && !self.memory_only,
        }
    }

    // ── persistence ─────────────────────────────────────────────────

    fn restore(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let snapshot = match store.get(&self.config.storage_key) {
            Ok(Some(text)) => text,
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(%err, "failed to read persisted queue");
                return;
            }
        };
        let items: Vec<QueueItem> = match serde_json::from_str(&snapshot) {
            Ok(items) => items,
            Err(err) => {
                tracing::warn!(%err, "persisted queue is corrupt, starting empty");
                return;
            }
        };

        let cutoff = now_millis().saturating_sub(ENTRY_EXPIRY.as_millis() as u64);
        let mut restored = 0usize;
        for mut item in items {
            if item.enqueued_at < cutoff {
                continue;
            }
            item.bytes = estimate_size(&item.payload);
            item.seq = self.next_seq;
            self.next_seq += 1;
            if self.insert(item).is_ok() {
                restored += 1;
            }
        }
        if restored > 0 {
            tracing::debug!(restored, "restored persisted queue entries");
        }
    }

    fn persist(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        if self.memory_only {
            return;
        }
        let snapshot = match serde_json::to_string(&self.items) {
            Ok(text) => text,
            Err(err) => {
                tracing::warn!(%err, "failed to serialize queue for persistence");
                return;
            }
        };
        match store.set(&self.config.storage_key, &snapshot) {
            Ok(()) => {}
            Err(StoreError::QuotaExceeded) => self.shrink_and_retry(&*store),
            Err(err) => tracing::warn!(%err, "queue persistence write failed"),
        }
    }

    /// Quota handling: evict half the low band, retry once, then give
    /// up on persistence for this session.
    fn shrink_and_retry(&mut self, store: &dyn KeyValueStore) {
        let mut low: Vec<usize> = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, it)| it.priority == Priority::Low)
            .map(|(idx, _)| idx)
            .collect();
        low.sort_by_key(|&idx| (self.items[idx].enqueued_at, self.items[idx].seq));
        let evict = low.len().div_ceil(2);
        let mut victims: Vec<usize> = low.into_iter().take(evict).collect();
        victims.sort_unstable_by(|a, b| b.cmp(a));
        for idx in victims {
            let dropped = self.items.remove(idx);
            self.total_bytes -= dropped.bytes;
        }
        if evict > 0 {
            tracing::warn!(evicted = evict, "storage quota hit, evicted low-priority entries");
        }

        let retry = serde_json::to_string(&self.items)
            .ok()
            .and_then(|text| store.set(&self.config.storage_key, &text).ok());
        if retry.is_none() {
            tracing::warn!("queue persistence disabled for this session (quota)");
            self.memory_only = true;
        }
    }
}

fn estimate_size(payload: &Value) -> usize {
    serde_json::to_string(payload).map(|s| s.len()).unwrap_or(0)
}
