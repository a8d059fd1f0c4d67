//! Event bus: typed publish/subscribe within the runtime.
//!
//! Maps a string event name to an ordered set of handlers. Emission runs
//! over a snapshot, so handlers registering or removing listeners
//! mid-delivery never perturb the delivery in flight. `once` listeners
//! are removed *before* their handler runs, so a panicking handler is
//! still gone afterwards.
//!
//! Closures are not comparable in Rust, so `on`/`once` hand back a
//! [`ListenerId`] and `off` takes `Option<ListenerId>`; `None` clears
//! the whole event.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;

/// Default listener-count threshold before a leak warning fires.
pub const DEFAULT_MAX_LISTENERS: usize = 10;

/// Handle identifying a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Handler = Arc<dyn Fn(&Value) + Send + Sync>;

struct Listener {
    id: ListenerId,
    once: bool,
    handler: Handler,
}

struct BusInner {
    events: HashMap<String, Vec<Listener>>,
    /// Event names that already got their max-listener warning.
    warned: HashSet<String>,
    max_listeners: usize,
}

/// Publish/subscribe bus keyed by event name.
pub struct EventBus {
    inner: Mutex<BusInner>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus with the default listener threshold.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BusInner {
                events: HashMap::new(),
                warned: HashSet::new(),
                max_listeners: DEFAULT_MAX_LISTENERS,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler invoked on every emission of `event`.
    pub fn on<F>(&self, event: &str, handler: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(event, Arc::new(handler), false)
    }

    /// Register a handler removed before its first invocation runs.
    pub fn once<F>(&self, event: &str, handler: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(event, Arc::new(handler), true)
    }

    fn register(&self, event: &str, handler: Handler, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut inner = self.inner.lock().unwrap();
        let max = inner.max_listeners;
        let listeners = inner.events.entry(event.to_string()).or_default();
        listeners.push(Listener {
            id,
            once,
            handler,
        });
        let count = listeners.len();
        if max > 0 && count > max && !inner.warned.contains(event) {
            inner.warned.insert(event.to_string());
            tracing::warn!(
                event,
                count,
                max,
                "possible listener leak: listener count exceeds threshold"
            );
        }
        id
    }

    /// Remove a single listener, or every listener for `event` when `id`
    /// is `None`. Returns how many listeners were removed.
    pub fn off(&self, event: &str, id: Option<ListenerId>) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let removed = match inner.events.get_mut(event) {
            Some(listeners) => match id {
                Some(id) => {
                    let before = listeners.len();
                    listeners.retain(|l| l.id != id);
                    before - listeners.len()
                }
                None => std::mem::take(listeners).len(),
            },
            None => 0,
        };
        if inner.events.get(event).is_some_and(|l| l.is_empty()) {
            inner.events.remove(event);
            inner.warned.remove(event);
        }
        removed
    }

    /// Emit `event` to every registered handler, in registration order.
    ///
    /// A panicking handler is logged and does not abort delivery to the
    /// handlers after it.
    pub fn emit(&self, event: &str, data: &Value) {
        let snapshot: Vec<(ListenerId, bool, Handler)> = {
            let inner = self.inner.lock().unwrap();
            match inner.events.get(event) {
                Some(listeners) => listeners
                    .iter()
                    .map(|l| (l.id, l.once, l.handler.clone()))
                    .collect(),
                None => return,
            }
        };

        for (id, once, handler) in snapshot {
            if once {
                // Removed before the user code runs, so a panic below
                // still leaves the listener gone and nested emissions
                // cannot re-enter it.
                self.off(event, Some(id));
            }
            if catch_unwind(AssertUnwindSafe(|| handler(data))).is_err() {
                tracing::warn!(event, "event handler panicked; continuing delivery");
            }
        }
    }

    /// Number of listeners registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .events
            .get(event)
            .map_or(0, |l| l.len())
    }

    /// Names of all events with at least one listener.
    pub fn event_names(&self) -> Vec<String> {
        self.inner.lock().unwrap().events.keys().cloned().collect()
    }

    /// Whether `event` has any listeners.
    pub fn has_listeners(&self, event: &str) -> bool {
        self.listener_count(event) > 0
    }

    /// Replace the leak-warning threshold; 0 disables the warning.
    /// Clears warned-once state so the new threshold warns afresh.
    pub fn set_max_listeners(&self, max: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.max_listeners = max;
        inner.warned.clear();
    }

    /// Drop every listener for every event.
    pub fn remove_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.events.clear();
        inner.warned.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
