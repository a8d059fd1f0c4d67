//! Monotonic, collision-resistant message identifiers.
//!
//! Ids combine a millisecond timestamp, a process-wide monotonic counter,
//! and a random suffix: `msg_1712345678901_42_9f3a`. The timestamp keeps
//! ids roughly sortable by creation time; the counter guarantees
//! uniqueness within a process; the suffix guards against collisions
//! across processes sharing a wire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Generator handing out unique string ids.
#[derive(Debug, Default)]
pub struct IdGenerator {
    counter: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at sequence 0.
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Produce the next id with the given prefix.
    pub fn next(&self, prefix: &str) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let suffix: u16 = rand::random();
        format!("{}_{}_{}_{:04x}", prefix, now_millis(), seq, suffix)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
