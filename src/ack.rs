//! ACK tracker: at-least-once delivery with retry and timeout.
//!
//! A reliable send records a pending entry keyed by the assigned id and
//! arms a retry timer. A paired ACK (inbound `{type:"ack", id}`)
//! settles the entry; each timer expiry re-sends through the injected
//! hook until the retry budget is spent, then the timeout callback fires
//! with a [`WireError::Timeout`].
//!
//! Each entry owns exactly one timer task for its whole lifetime; the
//! task loops over retry cycles internally instead of re-arming itself.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::{Result, WireError};
use crate::id::IdGenerator;
use crate::BoxFuture;

/// Default wait for an ACK before the first retry.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// Default retry budget.
pub const DEFAULT_ACK_RETRIES: u32 = 3;

/// Per-send reliability options.
#[derive(Debug, Clone)]
pub struct AckOptions {
    /// Wait per attempt; the tracker default applies when `None`.
    pub timeout: Option<Duration>,
    /// Re-sends after the original attempt.
    pub retries: u32,
}

impl Default for AckOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            retries: DEFAULT_ACK_RETRIES,
        }
    }
}

/// Invoked once with the ACK's `data` field when the peer acknowledges.
pub type AckCallback = Box<dyn FnOnce(Option<Value>) + Send>;
/// Invoked once when the retry budget is exhausted.
pub type AckTimeoutCallback = Box<dyn FnOnce(WireError) + Send>;
/// Hook re-sending a payload through the normal send path.
pub type AckSendFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Snapshot of tracker occupancy.
#[derive(Debug, Clone)]
pub struct AckStats {
    pub pending: usize,
    pub total_retries: u64,
    /// Age of the longest-outstanding entry.
    pub oldest_age: Option<Duration>,
}

struct PendingAck {
    payload: Value,
    enqueued_at: Instant,
    retries: u32,
    max_retries: u32,
    timeout: Duration,
    on_ack: Option<AckCallback>,
    on_timeout: Option<AckTimeoutCallback>,
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct AckInner {
    pending: HashMap<String, PendingAck>,
    total_retries: u64,
}

/// At-least-once delivery tracker.
pub struct AckTracker {
    inner: Arc<Mutex<AckInner>>,
    ids: IdGenerator,
    default_timeout: Duration,
    send_fn: AckSendFn,
}

impl AckTracker {
    /// Create a tracker re-sending through `send_fn`.
    pub fn new(default_timeout: Duration, send_fn: AckSendFn) -> Self {
        Self {
            inner: Arc::new(Mutex::new(AckInner::default())),
            ids: IdGenerator::new(),
            default_timeout,
            send_fn,
        }
    }

    /// Send `payload` reliably. Object payloads get the assigned id
    /// injected as their `id` field so the peer can pair its ACK.
    ///
    /// The initial dispatch failure is absorbed: the retry timer covers
    /// it like any other lost attempt.
    pub async fn send(
        &self,
        mut payload: Value,
        options: AckOptions,
        on_ack: AckCallback,
        on_timeout: AckTimeoutCallback,
    ) -> Result<String> {
        let id = self.ids.next("ack");
        if payload.is_object() {
            payload["id"] = Value::String(id.clone());
        }
        let timeout = options.timeout.unwrap_or(self.default_timeout);

        let timer = self.spawn_retry_timer(id.clone(), timeout);
        self.inner.lock().unwrap().pending.insert(
            id.clone(),
            PendingAck {
                payload: payload.clone(),
                enqueued_at: Instant::now(),
                retries: 0,
                max_retries: options.retries,
                timeout,
                on_ack: Some(on_ack),
                on_timeout: Some(on_timeout),
                timer: Some(timer),
            },
        );

        if let Err(err) = (self.send_fn)(payload).await {
            tracing::debug!(%err, %id, "initial reliable send failed; retry timer armed");
        }
        Ok(id)
    }

    fn spawn_retry_timer(&self, id: String, timeout: Duration) -> JoinHandle<()> {
        let inner = self.inner.clone();
        let send_fn = self.send_fn.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(timeout).await;

                enum Step {
                    Retry(Value),
                    Exhausted(Option<AckTimeoutCallback>, Duration),
                }
                let step = {
                    let mut guard = inner.lock().unwrap();
                    let state = &mut *guard;
                    // Settled or cancelled while we slept.
                    let Some(entry) = state.pending.get_mut(&id) else {
                        return;
                    };
                    if entry.retries < entry.max_retries {
                        entry.retries += 1;
                        state.total_retries += 1;
                        Step::Retry(entry.payload.clone())
                    } else {
                        match state.pending.remove(&id) {
                            Some(entry) => Step::Exhausted(entry.on_timeout, entry.timeout),
                            None => return,
                        }
                    }
                };

                match step {
                    Step::Retry(payload) => {
                        tracing::debug!(%id, "ack timeout, re-sending");
                        if let Err(err) = send_fn(payload).await {
                            tracing::debug!(%err, %id, "ack re-send failed");
                        }
                    }
                    Step::Exhausted(on_timeout, timeout) => {
                        if let Some(cb) = on_timeout {
                            cb(WireError::timeout("ack", timeout));
                        }
                        return;
                    }
                }
            }
        })
    }

    /// Settle a pending entry with the peer's ACK.
    ///
    /// Returns whether an entry existed for `id`.
    pub fn handle_ack(&self, id: &str, data: Option<Value>) -> bool {
        let entry = self.inner.lock().unwrap().pending.remove(id);
        match entry {
            Some(mut entry) => {
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
                if let Some(cb) = entry.on_ack.take() {
                    cb(data);
                }
                true
            }
            None => false,
        }
    }

    /// Drop a pending entry without invoking its callbacks.
    pub fn cancel(&self, id: &str) -> bool {
        match self.inner.lock().unwrap().pending.remove(id) {
            Some(mut entry) => {
                if let Some(timer) = entry.timer.take() {
                    timer.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Drop every pending entry; used on session loss and destroy.
    pub fn cancel_all(&self) {
        let mut guard = self.inner.lock().unwrap();
        for (_, mut entry) in guard.pending.drain() {
            if let Some(timer) = entry.timer.take() {
                timer.abort();
            }
        }
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> AckStats {
        let guard = self.inner.lock().unwrap();
        AckStats {
            pending: guard.pending.len(),
            total_retries: guard.total_retries,
            oldest_age: guard
                .pending
                .values()
                .map(|e| e.enqueued_at.elapsed())
                .max(),
        }
    }
}

impl Drop for AckTracker {
    fn drop(&mut self) {
        self.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recording_send() -> (AckSendFn, Arc<Mutex<Vec<Value>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sent_clone = sent.clone();
        let send: AckSendFn = Arc::new(move |payload| {
            let sent = sent_clone.clone();
            Box::pin(async move {
                sent.lock().unwrap().push(payload);
                Ok(())
            })
        });
        (send, sent)
    }

    fn opts(timeout_ms: u64, retries: u32) -> AckOptions {
        AckOptions {
            timeout: Some(Duration::from_millis(timeout_ms)),
            retries,
        }
    }

    #[tokio::test]
    async fn test_ack_settles_entry() {
        let (send, sent) = recording_send();
        let tracker = AckTracker::new(DEFAULT_ACK_TIMEOUT, send);
        let acked = Arc::new(Mutex::new(None));
        let acked_clone = acked.clone();

        let id = tracker
            .send(
                json!({"x": 1}),
                opts(5_000, 2),
                Box::new(move |data| *acked_clone.lock().unwrap() = Some(data)),
                Box::new(|_| panic!("timeout must not fire")),
            )
            .await
            .unwrap();

        // The wire payload carries the assigned id.
        assert_eq!(sent.lock().unwrap()[0]["id"], json!(id.clone()));
        assert_eq!(tracker.stats().pending, 1);

        assert!(tracker.handle_ack(&id, Some(json!({"ok": true}))));
        assert_eq!(tracker.stats().pending, 0);
        assert_eq!(*acked.lock().unwrap(), Some(Some(json!({"ok": true}))));

        // Duplicate ACK is a no-op.
        assert!(!tracker.handle_ack(&id, None));
    }

    #[tokio::test]
    async fn test_retries_then_timeout() {
        let (send, sent) = recording_send();
        let tracker = AckTracker::new(DEFAULT_ACK_TIMEOUT, send);
        let timeouts = Arc::new(AtomicUsize::new(0));
        let timeouts_clone = timeouts.clone();

        tracker
            .send(
                json!({"x": 1}),
                opts(20, 2),
                Box::new(|_| panic!("ack must not fire")),
                Box::new(move |err| {
                    assert!(matches!(err, WireError::Timeout { .. }));
                    timeouts_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        // Original + 2 retries on the wire, then exactly one timeout.
        assert_eq!(sent.lock().unwrap().len(), 3);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.stats().pending, 0);
        assert_eq!(tracker.stats().total_retries, 2);
    }

    #[tokio::test]
    async fn test_zero_retries_times_out_after_one_send() {
        let (send, sent) = recording_send();
        let tracker = AckTracker::new(DEFAULT_ACK_TIMEOUT, send);
        let timeouts = Arc::new(AtomicUsize::new(0));
        let timeouts_clone = timeouts.clone();

        tracker
            .send(
                json!({"only": "once"}),
                opts(15, 0),
                Box::new(|_| {}),
                Box::new(move |_| {
                    timeouts_clone.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_suppresses_callbacks() {
        let (send, _) = recording_send();
        let tracker = AckTracker::new(DEFAULT_ACK_TIMEOUT, send);

        let id = tracker
            .send(
                json!({"x": 1}),
                opts(10, 5),
                Box::new(|_| panic!("ack must not fire")),
                Box::new(|_| panic!("timeout must not fire")),
            )
            .await
            .unwrap();

        assert!(tracker.cancel(&id));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tracker.stats().pending, 0);
    }

    #[tokio::test]
    async fn test_cancel_all_clears_everything() {
        let (send, sent) = recording_send();
        let tracker = AckTracker::new(DEFAULT_ACK_TIMEOUT, send);
        for i in 0..4 {
            tracker
                .send(
                    json!({ "n": i }),
                    opts(10, 5),
                    Box::new(|_| {}),
                    Box::new(|_| panic!("timeout must not fire after cancel_all")),
                )
                .await
                .unwrap();
        }
        tracker.cancel_all();
        let sent_before = sent.lock().unwrap().len();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tracker.stats().pending, 0);
        // No retries after cancellation either.
        assert_eq!(sent.lock().unwrap().len(), sent_before);
    }

    #[tokio::test]
    async fn test_non_object_payload_not_id_injected() {
        let (send, sent) = recording_send();
        let tracker = AckTracker::new(DEFAULT_ACK_TIMEOUT, send);
        tracker
            .send(json!("bare string"), opts(5_000, 0), Box::new(|_| {}), Box::new(|_| {}))
            .await
            .unwrap();
        assert_eq!(sent.lock().unwrap()[0], json!("bare string"));
        tracker.cancel_all();
    }

    #[tokio::test]
    async fn test_stats_oldest_age() {
        let (send, _) = recording_send();
        let tracker = AckTracker::new(DEFAULT_ACK_TIMEOUT, send);
        tracker
            .send(json!({}), opts(5_000, 0), Box::new(|_| {}), Box::new(|_| {}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = tracker.stats();
        assert!(stats.oldest_age.unwrap() >= Duration::from_millis(15));
        tracker.cancel_all();
    }
}
