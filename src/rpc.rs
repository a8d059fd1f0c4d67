//! RPC correlator: request/response pairing with timeout.
//!
//! An outbound request is wrapped in a `{type:"rpc_request", id, data}`
//! envelope; the matching inbound `{type:"rpc_response", requestId,
//! data|error}` settles the pending entry. Entries also settle on timer
//! expiry (rejected with [`WireError::Timeout`]) and on connection loss
//! (the facade calls [`cancel_all`](RpcCorrelator::cancel_all); requests
//! are not re-sent on reconnect).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{Result, WireError};
use crate::id::IdGenerator;

/// Default wait for a response.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Envelope `type` of an outbound request.
pub const RPC_REQUEST_TYPE: &str = "rpc_request";
/// Envelope `type` of an inbound response.
pub const RPC_RESPONSE_TYPE: &str = "rpc_response";

struct PendingRpc {
    enqueued_at: Instant,
    tx: oneshot::Sender<Result<Value>>,
    timer: JoinHandle<()>,
}

/// Completion handle for one request.
pub struct RpcCompletion {
    rx: oneshot::Receiver<Result<Value>>,
}

impl RpcCompletion {
    /// Wait for the response, the timeout, or cancellation.
    pub async fn wait(self) -> Result<Value> {
        match self.rx.await {
            Ok(outcome) => outcome,
            // Correlator dropped without settling; treat as cancelled.
            Err(_) => Err(WireError::Connection("rpc cancelled".into())),
        }
    }
}

/// Pending request table.
pub struct RpcCorrelator {
    inner: Arc<Mutex<HashMap<String, PendingRpc>>>,
    ids: IdGenerator,
    default_timeout: Duration,
}

impl RpcCorrelator {
    /// Create a correlator with the given default timeout.
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ids: IdGenerator::new(),
            default_timeout,
        }
    }

    /// Register a pending request and arm its timer.
    ///
    /// The caller sends [`envelope`](Self::envelope)`(id, payload)` and
    /// awaits the returned completion.
    pub fn register(&self, timeout: Option<Duration>) -> (String, RpcCompletion) {
        let id = self.ids.next("rpc");
        let timeout = timeout.unwrap_or(self.default_timeout);
        let (tx, rx) = oneshot::channel();

        let timer_inner = self.inner.clone();
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(entry) = timer_inner.lock().unwrap().remove(&timer_id) {
                let _ = entry.tx.send(Err(WireError::timeout("rpc", timeout)));
            }
        });

        self.inner.lock().unwrap().insert(
            id.clone(),
            PendingRpc {
                enqueued_at: Instant::now(),
                tx,
                timer,
            },
        );
        (id, RpcCompletion { rx })
    }

    /// Wrap a payload in the request envelope.
    pub fn envelope(id: &str, payload: Value) -> Value {
        json!({
            "type": RPC_REQUEST_TYPE,
            "id": id,
            "data": payload,
        })
    }

    /// Whether an inbound message is an RPC response.
    pub fn is_response(message: &Value) -> bool {
        message.get("type").and_then(Value::as_str) == Some(RPC_RESPONSE_TYPE)
            && message.get("requestId").and_then(Value::as_str).is_some()
    }

    /// Settle the pending entry a response addresses.
    ///
    /// An `error` field rejects; anything else resolves with the
    /// response's `data`. Returns whether an entry was settled.
    pub fn handle_response(&self, message: &Value) -> bool {
        let Some(request_id) = message.get("requestId").and_then(Value::as_str) else {
            return false;
        };
        let Some(entry) = self.inner.lock().unwrap().remove(request_id) else {
            return false;
        };
        entry.timer.abort();

        let outcome = match message.get("error") {
            Some(err) => {
                let text = err
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| err.to_string());
                Err(WireError::Protocol(text))
            }
            None => Ok(message.get("data").cloned().unwrap_or(Value::Null)),
        };
        let _ = entry.tx.send(outcome);
        true
    }

    /// Reject one pending request.
    pub fn cancel(&self, id: &str, reason: &str) -> bool {
        match self.inner.lock().unwrap().remove(id) {
            Some(entry) => {
                entry.timer.abort();
                let _ = entry.tx.send(Err(WireError::Connection(reason.to_string())));
                true
            }
            None => false,
        }
    }

    /// Reject every pending request with the same reason; used on
    /// connection loss and destroy.
    pub fn cancel_all(&self, reason: &str) {
        let drained: Vec<PendingRpc> = {
            let mut guard = self.inner.lock().unwrap();
            guard.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            entry.timer.abort();
            let _ = entry.tx.send(Err(WireError::Connection(reason.to_string())));
        }
    }

    /// Number of requests awaiting responses.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Age of the longest-outstanding request.
    pub fn oldest_age(&self) -> Option<Duration> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .map(|e| e.enqueued_at.elapsed())
            .max()
    }
}

impl Drop for RpcCorrelator {
    fn drop(&mut self) {
        self.cancel_all("correlator dropped");
    }
}
