//! Batch sender: coalesces messages with size/byte/time triggers.
//!
//! `add` buffers until any trigger fires: buffered count reaches
//! `max_size`, the byte estimate reaches `max_bytes`, or `max_wait` has
//! passed since the first buffered message. The injected send hook
//! receives the whole batch and owns its wire framing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::BoxFuture;

/// Batch trigger thresholds.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Flush at this many buffered messages.
    pub max_size: usize,
    /// Flush when the serialized estimate reaches this many bytes.
    pub max_bytes: usize,
    /// Flush this long after the first buffered message.
    pub max_wait: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: 10,
            max_bytes: 16 * 1024,
            max_wait: Duration::from_millis(100),
        }
    }
}

/// Hook receiving each flushed batch.
pub type BatchSendFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct BatchInner {
    buffer: Vec<Value>,
    bytes: usize,
    timer: Option<JoinHandle<()>>,
    send_fn: Option<BatchSendFn>,
}

/// Coalescing buffer in front of a send hook.
pub struct BatchSender {
    config: BatchConfig,
    inner: Arc<Mutex<BatchInner>>,
}

impl BatchSender {
    /// Create a sender flushing into `send_fn`.
    pub fn new(config: BatchConfig, send_fn: BatchSendFn) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(BatchInner {
                buffer: Vec::new(),
                bytes: 0,
                timer: None,
                send_fn: Some(send_fn),
            })),
        }
    }

    /// Buffer a message; flushes inline when a size trigger fires.
    pub async fn add(&self, message: Value) -> Result<()> {
        let flush_now = {
            let mut inner = self.inner.lock().unwrap();
            inner.bytes += estimate_size(&message);
            inner.buffer.push(message);

            if inner.buffer.len() >= self.config.max_size || inner.bytes >= self.config.max_bytes {
                true
            } else {
                if inner.buffer.len() == 1 {
                    // First buffered message arms the wait timer.
                    if let Some(old) = inner.timer.take() {
                        old.abort();
                    }
                    let timer_inner = self.inner.clone();
                    let wait = self.config.max_wait;
                    inner.timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(wait).await;
                        if let Err(err) = Self::flush_shared(&timer_inner).await {
                            tracing::warn!(%err, "timed batch flush failed");
                        }
                    }));
                }
                false
            }
        };

        if flush_now {
            Self::flush_shared(&self.inner).await
        } else {
            Ok(())
        }
    }

    /// Flush whatever is buffered. Idempotent; an empty buffer is a
    /// no-op.
    pub async fn flush(&self) -> Result<()> {
        Self::flush_shared(&self.inner).await
    }

    async fn flush_shared(inner: &Arc<Mutex<BatchInner>>) -> Result<()> {
        let (batch, send_fn) = {
            let mut guard = inner.lock().unwrap();
            if let Some(timer) = guard.timer.take() {
                timer.abort();
            }
            if guard.buffer.is_empty() {
                return Ok(());
            }
            guard.bytes = 0;
            (std::mem::take(&mut guard.buffer), guard.send_fn.clone())
        };
        match send_fn {
            Some(send) => send(batch).await,
            None => Ok(()),
        }
    }

    /// Number of buffered messages.
    pub fn buffered(&self) -> usize {
        self.inner.lock().unwrap().buffer.len()
    }

    /// Flush, then drop the send hook; later `add`s buffer forever.
    pub async fn destroy(&self) {
        if let Err(err) = self.flush().await {
            tracing::warn!(%err, "final batch flush failed");
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.send_fn = None;
    }
}

fn estimate_size(message: &Value) -> usize {
    serde_json::to_string(message).map(|s| s.len()).unwrap_or(0)
}
