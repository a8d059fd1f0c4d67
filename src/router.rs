//! Router: pattern- and channel-based fan-out of inbound messages.
//!
//! Routes match a message's `type` against dot-separated patterns where
//! `*` matches exactly one segment and `**` any number. Messages that
//! carry a `channel` field are only routed while that channel is
//! subscribed; unsubscribed-channel traffic is dropped from routing (the
//! facade still emits the generic `message` event for it).
//!
//! Matching routes fire in stable descending-priority order; `once`
//! routes remove themselves before their first invocation; a panicking
//! handler is isolated and later handlers still run.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::id::now_millis;

/// Handle identifying a registered route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId(u64);

/// Handler invoked with the routed message.
pub type RouteHandler = Arc<dyn Fn(&Value) + Send + Sync>;

struct RouteEntry {
    id: RouteId,
    pattern: String,
    handler: RouteHandler,
    priority: i32,
    once: bool,
    /// Insertion order; ties on priority resolve to it.
    seq: u64,
}

struct Subscription {
    subscribed_at: u64,
    handler: Option<RouteHandler>,
}

struct RouterInner {
    routes: Vec<RouteEntry>,
    default: Option<RouteHandler>,
    subscriptions: HashMap<String, Subscription>,
    next_id: u64,
}

/// Inbound fan-out table.
pub struct Router {
    inner: Mutex<RouterInner>,
}

impl Router {
    /// Empty router: no routes, no subscriptions, no default.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RouterInner {
                routes: Vec::new(),
                default: None,
                subscriptions: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// Register a route. Higher `priority` fires first; ties fire in
    /// registration order.
    pub fn on<F>(&self, pattern: &str, handler: F, priority: i32) -> RouteId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(pattern, Arc::new(handler), priority, false)
    }

    /// Register a route that removes itself before its first invocation.
    pub fn once<F>(&self, pattern: &str, handler: F, priority: i32) -> RouteId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.register(pattern, Arc::new(handler), priority, true)
    }

    fn register(&self, pattern: &str, handler: RouteHandler, priority: i32, once: bool) -> RouteId {
        let mut inner = self.inner.lock().unwrap();
        let id = RouteId(inner.next_id);
        inner.next_id += 1;
        let seq = inner.next_id;
        inner.routes.push(RouteEntry {
            id,
            pattern: pattern.to_string(),
            handler,
            priority,
            once,
            seq,
        });
        id
    }

    /// Remove a route. Returns whether it existed.
    pub fn off(&self, id: RouteId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.routes.len();
        inner.routes.retain(|r| r.id != id);
        inner.routes.len() != before
    }

    /// Handler for messages no route matches.
    pub fn set_default<F>(&self, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.lock().unwrap().default = Some(Arc::new(handler));
    }

    /// Open a channel; messages bearing it become routable.
    pub fn subscribe(&self, channel: &str) {
        self.subscribe_with_handler(channel, None);
    }

    /// Open a channel with a handler invoked for every message on it.
    pub fn subscribe_with_handler(&self, channel: &str, handler: Option<RouteHandler>) {
        self.inner.lock().unwrap().subscriptions.insert(
            channel.to_string(),
            Subscription {
                subscribed_at: now_millis(),
                handler,
            },
        );
    }

    /// Close a channel. Returns whether it was open.
    pub fn unsubscribe(&self, channel: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .remove(channel)
            .is_some()
    }

    /// Whether a channel is open.
    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.inner.lock().unwrap().subscriptions.contains_key(channel)
    }

    /// Open channels with their subscription timestamps.
    pub fn subscriptions(&self) -> Vec<(String, u64)> {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .iter()
            .map(|(name, sub)| (name.clone(), sub.subscribed_at))
            .collect()
    }

    /// Number of registered routes.
    pub fn route_count(&self) -> usize {
        self.inner.lock().unwrap().routes.len()
    }

    /// Fan a message out to every matching route.
    ///
    /// Returns how many handlers ran (routes, channel handler, and the
    /// default handler all count). Messages on unsubscribed channels run
    /// nothing and return 0.
    pub fn dispatch(&self, message: &Value) -> usize {
        let channel = message.get("channel").and_then(Value::as_str);
        let msg_type = message.get("type").and_then(Value::as_str);

        let (matching, channel_handler, default) = {
            let mut inner = self.inner.lock().unwrap();

            let channel_handler = match channel {
                Some(name) => match inner.subscriptions.get(name) {
                    Some(sub) => sub.handler.clone(),
                    // Unsubscribed channel: dropped from routing.
                    None => return 0,
                },
                None => None,
            };

            let mut matching: Vec<(RouteId, i32, u64, RouteHandler, bool)> = inner
                .routes
                .iter()
                .filter(|r| match msg_type {
                    Some(t) => pattern_matches(&r.pattern, t),
                    None => false,
                })
                .map(|r| (r.id, r.priority, r.seq, r.handler.clone(), r.once))
                .collect();
            matching.sort_by_key(|(_, priority, seq, _, _)| (std::cmp::Reverse(*priority), *seq));

            // Self-removal happens before invocation, so a panicking
            // once-handler is still gone and nested dispatches cannot
            // re-enter it.
            let once_ids: Vec<RouteId> = matching
                .iter()
                .filter(|(_, _, _, _, once)| *once)
                .map(|(id, ..)| *id)
                .collect();
            inner.routes.retain(|r| !once_ids.contains(&r.id));

            let default = if matching.is_empty() {
                inner.default.clone()
            } else {
                None
            };
            (matching, channel_handler, default)
        };

        let mut invoked = 0;
        if let Some(handler) = channel_handler {
            invoke_isolated(&handler, message);
            invoked += 1;
        }
        for (_, _, _, handler, _) in &matching {
            invoke_isolated(handler, message);
            invoked += 1;
        }
        if let Some(handler) = default {
            invoke_isolated(&handler, message);
            invoked += 1;
        }
        invoked
    }

    /// Drop every route, subscription, and the default handler.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.routes.clear();
        inner.subscriptions.clear();
        inner.default = None;
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

fn invoke_isolated(handler: &RouteHandler, message: &Value) {
    if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
        tracing::warn!("route handler panicked; continuing dispatch");
    }
}

/// Match a dot-separated `type` against a pattern where `*` is one
/// segment and `**` any number of segments.
pub fn pattern_matches(pattern: &str, topic: &str) -> bool {
    fn matches(pattern: &[&str], topic: &[&str]) -> bool {
        match pattern.split_first() {
            None => topic.is_empty(),
            Some((&"**", rest)) => {
                (0..=topic.len()).any(|skip| matches(rest, &topic[skip..]))
            }
            Some((seg, rest)) => match topic.split_first() {
                Some((t, trest)) => (*seg == "*" || seg == t) && matches(rest, trest),
                None => false,
            },
        }
    }
    let pattern: Vec<&str> = pattern.split('.').collect();
    let topic: Vec<&str> = topic.split('.').collect();
    matches(&pattern, &topic)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_pattern_matching() {
        assert!(pattern_matches("orders.created", "orders.created"));
        assert!(!pattern_matches("orders.created", "orders.deleted"));

        assert!(pattern_matches("orders.*", "orders.created"));
        assert!(!pattern_matches("orders.*", "orders.eu.created"));
        assert!(!pattern_matches("orders.*", "orders"));

        assert!(pattern_matches("orders.**", "orders.created"));
        assert!(pattern_matches("orders.**", "orders.eu.created"));
        assert!(pattern_matches("**", "anything.at.all"));
        assert!(pattern_matches("orders.**.created", "orders.eu.west.created"));
    }

    #[test]
    fn test_dispatch_by_type() {
        let router = Router::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        router.on(
            "orders.*",
            move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            },
            0,
        );

        assert_eq!(router.dispatch(&json!({"type": "orders.created"})), 1);
        assert_eq!(router.dispatch(&json!({"type": "users.created"})), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_priority_order_with_stable_ties() {
        let router = Router::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (tag, priority) in [("low", 0), ("first-high", 10), ("second-high", 10)] {
            let order = order.clone();
            router.on(
                "evt",
                move |_| order.lock().unwrap().push(tag),
                priority,
            );
        }

        router.dispatch(&json!({"type": "evt"}));
        assert_eq!(
            *order.lock().unwrap(),
            vec!["first-high", "second-high", "low"]
        );
    }

    #[test]
    fn test_once_route_self_removes() {
        let router = Router::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        router.once(
            "evt",
            move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            },
            0,
        );

        router.dispatch(&json!({"type": "evt"}));
        router.dispatch(&json!({"type": "evt"}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(router.route_count(), 0);
    }

    #[test]
    fn test_panicking_handler_isolated() {
        let router = Router::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        router.on("evt", |_| panic!("handler failure"), 10);
        router.on(
            "evt",
            move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            },
            0,
        );

        assert_eq!(router.dispatch(&json!({"type": "evt"})), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_default_handler_fires_only_on_no_match() {
        let router = Router::new();
        let defaults = Arc::new(AtomicUsize::new(0));
        let defaults_clone = defaults.clone();
        router.set_default(move |_| {
            defaults_clone.fetch_add(1, Ordering::SeqCst);
        });
        router.on("known", |_| {}, 0);

        router.dispatch(&json!({"type": "known"}));
        assert_eq!(defaults.load(Ordering::SeqCst), 0);

        router.dispatch(&json!({"type": "unknown"}));
        assert_eq!(defaults.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_gating() {
        let router = Router::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        router.on(
            "tick",
            move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            },
            0,
        );

        let message = json!({"type": "tick", "channel": "prices"});
        assert_eq!(router.dispatch(&message), 0);

        router.subscribe("prices");
        assert_eq!(router.dispatch(&message), 1);

        router.unsubscribe("prices");
        assert_eq!(router.dispatch(&message), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_channel_handler_runs_alongside_routes() {
        let router = Router::new();
        let channel_hits = Arc::new(AtomicUsize::new(0));
        let channel_clone = channel_hits.clone();
        router.subscribe_with_handler(
            "prices",
            Some(Arc::new(move |_| {
                channel_clone.fetch_add(1, Ordering::SeqCst);
            })),
        );
        router.on("tick", |_| {}, 0);

        let invoked = router.dispatch(&json!({"type": "tick", "channel": "prices"}));
        assert_eq!(invoked, 2);
        assert_eq!(channel_hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_removes_route() {
        let router = Router::new();
        let id = router.on("evt", |_| {}, 0);
        assert!(router.off(id));
        assert!(!router.off(id));
        assert_eq!(router.dispatch(&json!({"type": "evt"})), 0);
    }

    #[test]
    fn test_message_without_type_only_default() {
        let router = Router::new();
        router.on("**", |_| {}, 0);
        let defaults = Arc::new(AtomicUsize::new(0));
        let defaults_clone = defaults.clone();
        router.set_default(move |_| {
            defaults_clone.fetch_add(1, Ordering::SeqCst);
        });

        router.dispatch(&json!({"payload": 1}));
        assert_eq!(defaults.load(Ordering::SeqCst), 1);
    }
}
