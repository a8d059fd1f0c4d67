//! Client facade: composes every subsystem into the public surface.
//!
//! The [`WireClient`] owns the transport, the state machine, and every
//! overlay (queue, heartbeat, reconnect, ACK, RPC, router, dedup,
//! monitor). Subsystems never hold each other; they get capability
//! callbacks (`send` hooks, timeout hooks) that reach back through a
//! weak reference to the facade, so teardown is a single `destroy`.
//!
//! Lifecycle: `connect` drives `disconnected → connecting → connected`,
//! emits `open`, starts the heartbeat, then flushes the offline queue.
//! An unclean close enters the reconnect loop; a clean or local close
//! settles at `disconnected`. Inbound frames run codec → receive
//! middleware → classification (pong / ack / rpc / routed message).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::ack::{AckCallback, AckOptions, AckSendFn, AckStats, AckTimeoutCallback, AckTracker};
use crate::adapter::{
    ConnectTarget, Connection, Incoming, NativeTransport, PairTransport, Transport,
    TransportEvent, TransportEvents,
};
use crate::batch::{BatchConfig, BatchSendFn, BatchSender};
use crate::codec::CodecChain;
use crate::config::{AdapterKind, ClientConfig};
use crate::dedup::{DedupConfig, Deduplicator};
use crate::error::{Result, WireError};
use crate::event::{EventBus, ListenerId};
use crate::heartbeat::HeartbeatController;
use crate::id::now_millis;
use crate::middleware::{Direction, Middleware, MiddlewareContext, MiddlewarePipeline};
use crate::monitor::{Metrics, MonitorConfig, PerformanceMonitor};
use crate::queue::{MessageQueue, Priority, QueueStats};
use crate::reconnect::ReconnectController;
use crate::router::{RouteHandler, RouteId, Router};
use crate::rpc::{RpcCorrelator, DEFAULT_RPC_TIMEOUT};
use crate::state::{ConnectionState, StateMachine, Transition};
use crate::storage::{KeyValueStore, MemoryStore};

/// Close code used when the heartbeat declares the peer dead.
pub const HEARTBEAT_CLOSE_CODE: u16 = 4001;

/// Event names emitted on the client's event surface.
pub mod events {
    pub const OPEN: &str = "open";
    pub const CLOSE: &str = "close";
    pub const ERROR: &str = "error";
    pub const MESSAGE: &str = "message";
    pub const RECONNECTING: &str = "reconnecting";
    pub const RECONNECTED: &str = "reconnected";
    pub const RECONNECT_FAILED: &str = "reconnect-failed";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const STATE_CHANGE: &str = "state-change";
}

/// Per-send options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub priority: Priority,
}

impl SendOptions {
    /// Shorthand for a given priority.
    pub fn priority(priority: Priority) -> Self {
        Self { priority }
    }
}

/// Builder for configuring and creating a [`WireClient`].
///
/// Construction never opens a socket; call
/// [`connect`](WireClient::connect) on the built client.
pub struct ClientBuilder {
    config: ClientConfig,
    transport: Option<Box<dyn Transport>>,
    store: Option<Arc<dyn KeyValueStore>>,
    middleware: Vec<(Arc<dyn Middleware>, Option<Direction>)>,
}

impl ClientBuilder {
    /// Start from a full configuration.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            transport: None,
            store: None,
            middleware: Vec::new(),
        }
    }

    /// Replace the transport with a custom implementation; overrides
    /// the `adapter` config key.
    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Backing store for queue persistence.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Register a middleware on both chains.
    pub fn middleware(mut self, mw: Arc<dyn Middleware>) -> Self {
        self.middleware.push((mw, None));
        self
    }

    /// Register a middleware on one chain.
    pub fn middleware_for(mut self, direction: Direction, mw: Arc<dyn Middleware>) -> Self {
        self.middleware.push((mw, Some(direction)));
        self
    }

    /// Build the client. Validates codec key material; does not touch
    /// the network.
    pub fn build(self) -> Result<WireClient> {
        let codec = CodecChain::new(
            self.config.compression.clone(),
            self.config.encryption.clone(),
        )?;

        let transport: Box<dyn Transport> = match self.transport {
            Some(custom) => custom,
            None => match self.config.adapter {
                AdapterKind::Native => Box::new(NativeTransport::new()),
                AdapterKind::Pair => Box::new(PairTransport::detached()),
            },
        };

        let store = match (self.config.queue.persistent, self.store) {
            (true, Some(store)) => Some(store),
            (true, None) => Some(Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>),
            (false, _) => None,
        };
        let queue = MessageQueue::new(self.config.queue.clone(), store);

        let pipeline = MiddlewarePipeline::new();
        for (mw, direction) in self.middleware {
            match direction {
                Some(Direction::Send) => pipeline.use_send(mw),
                Some(Direction::Receive) => pipeline.use_receive(mw),
                None => pipeline.use_both(mw),
            }
        }

        let heartbeat = HeartbeatController::new(self.config.heartbeat.clone());
        let reconnect = ReconnectController::new(self.config.reconnect.clone());

        let inner = Arc::new_cyclic(|weak| {
            let ack_weak = weak.clone();
            let ack_send: AckSendFn = Arc::new(move |payload| {
                let weak = ack_weak.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(inner) => ClientInner::wire_send(&inner, payload).await,
                        None => Err(WireError::State("client destroyed".into())),
                    }
                })
            });

            ClientInner {
                config: self.config,
                bus: EventBus::new(),
                transport,
                state: StateMachine::new(),
                conn: Mutex::new(None),
                conn_task: Mutex::new(None),
                epoch: AtomicU64::new(0),
                queue: Mutex::new(queue),
                pipeline,
                codec,
                acks: AckTracker::new(crate::ack::DEFAULT_ACK_TIMEOUT, ack_send),
                rpc: RpcCorrelator::new(DEFAULT_RPC_TIMEOUT),
                router: Router::new(),
                dedup: Deduplicator::new(DedupConfig::default()),
                monitor: Mutex::new(PerformanceMonitor::new(MonitorConfig::default())),
                heartbeat,
                reconnect,
                destroyed: AtomicBool::new(false),
                reconnect_started_at: Mutex::new(None),
            }
        });

        Ok(WireClient { inner })
    }
}

/// Resilient WebSocket client.
pub struct WireClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    bus: EventBus,
    transport: Box<dyn Transport>,
    state: StateMachine,
    conn: Mutex<Option<Arc<dyn Connection>>>,
    conn_task: Mutex<Option<JoinHandle<()>>>,
    /// Bumped whenever the active connection changes; stale event loops
    /// observe the mismatch and stop.
    epoch: AtomicU64,
    queue: Mutex<MessageQueue>,
    pipeline: MiddlewarePipeline,
    codec: CodecChain,
    acks: AckTracker,
    rpc: RpcCorrelator,
    router: Router,
    dedup: Deduplicator,
    monitor: Mutex<PerformanceMonitor>,
    heartbeat: HeartbeatController,
    reconnect: ReconnectController,
    destroyed: AtomicBool,
    reconnect_started_at: Mutex<Option<Instant>>,
}

impl WireClient {
    /// Builder entry point.
    pub fn builder(config: ClientConfig) -> ClientBuilder {
        ClientBuilder::new(config)
    }

    /// Build with defaults for the given URL.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        ClientBuilder::new(ClientConfig::new(url)).build()
    }

    // ── lifecycle ───────────────────────────────────────────────────

    /// Open the connection.
    ///
    /// Returns immediately when already connecting or connected. A
    /// failure with reconnect enabled is absorbed into the backoff loop
    /// and surfaced through `reconnecting`/`reconnect-failed` events;
    /// with reconnect disabled it is returned.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        ClientInner::ensure_alive(inner)?;

        match inner.state.state() {
            ConnectionState::Connected | ConnectionState::Connecting => return Ok(()),
            ConnectionState::Disconnected => {
                // A fresh socket after full disconnect starts a new
                // session; reconnects within a lifetime keep theirs.
                inner.state.reset_session();
            }
            _ => {}
        }

        ClientInner::transition(inner, ConnectionState::Connecting)?;
        ClientInner::attempt_connect(inner).await
    }

    /// Close the connection locally. Never surfaces transport errors;
    /// state settles at `disconnected`.
    pub async fn disconnect(&self, code: Option<u16>, reason: Option<&str>) -> Result<()> {
        let inner = &self.inner;
        ClientInner::ensure_alive(inner)?;
        ClientInner::disconnect(inner, code, reason.map(str::to_string)).await;
        Ok(())
    }

    /// Tear the client down. Idempotent; afterwards every public
    /// operation fails fast with a state error.
    pub async fn destroy(&self) {
        ClientInner::destroy(&self.inner).await;
    }

    // ── sending ─────────────────────────────────────────────────────

    /// Send a payload through the middleware pipeline and codec.
    ///
    /// While disconnected the payload is queued when the queue is
    /// enabled, otherwise the call fails with a state error. A
    /// transient wire failure is also absorbed into the queue.
    pub async fn send(&self, payload: Value, options: SendOptions) -> Result<()> {
        let inner = &self.inner;
        ClientInner::ensure_alive(inner)?;

        let mut ctx = MiddlewareContext::new(payload, Direction::Send);
        inner.pipeline.execute(&mut ctx).await?;
        if ctx.should_skip {
            return Ok(());
        }
        let payload = ctx.data;

        if inner.state.state() == ConnectionState::Connected {
            match ClientInner::wire_send(inner, payload.clone()).await {
                Ok(()) => Ok(()),
                // A state error here means the socket dropped between
                // the check and the send; treat it like any transient
                // wire failure.
                Err(err)
                    if inner.config.queue.enabled
                        && (err.is_retryable() || matches!(err, WireError::State(_))) =>
                {
                    tracing::debug!(%err, "send failed, queueing payload");
                    inner
                        .queue
                        .lock()
                        .unwrap()
                        .enqueue(payload, options.priority)?;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        } else if inner.config.queue.enabled {
            inner
                .queue
                .lock()
                .unwrap()
                .enqueue(payload, options.priority)?;
            Ok(())
        } else {
            Err(WireError::State("not connected and queue disabled".into()))
        }
    }

    /// Send raw bytes, bypassing queue, pipeline, and codec. Requires
    /// an open connection.
    pub async fn send_binary(&self, data: Bytes) -> Result<()> {
        let inner = &self.inner;
        ClientInner::ensure_alive(inner)?;
        let conn = ClientInner::current_conn(inner)
            .ok_or_else(|| WireError::State("not connected".into()))?;
        conn.send_binary(data).await?;
        inner.state.with_session(|s| s.messages_sent += 1);
        inner.monitor.lock().unwrap().record_send();
        Ok(())
    }

    /// Send with at-least-once delivery. Returns the tracking id; the
    /// callbacks fire on ACK or on retry exhaustion. Bypasses the
    /// middleware pipeline.
    pub async fn send_reliable(
        &self,
        payload: Value,
        options: AckOptions,
        on_ack: AckCallback,
        on_timeout: AckTimeoutCallback,
    ) -> Result<String> {
        ClientInner::ensure_alive(&self.inner)?;
        self.inner.acks.send(payload, options, on_ack, on_timeout).await
    }

    /// Issue a request and await its correlated response.
    pub async fn request(&self, payload: Value, timeout: Option<Duration>) -> Result<Value> {
        let inner = &self.inner;
        ClientInner::ensure_alive(inner)?;
        let (id, completion) = inner.rpc.register(timeout);
        let envelope = RpcCorrelator::envelope(&id, payload);
        if let Err(err) = ClientInner::wire_send(inner, envelope).await {
            inner.rpc.cancel(&id, &err.to_string());
        }
        completion.wait().await
    }

    /// A batch sender whose flushes go through this client's send path
    /// at normal priority.
    pub fn batch_sender(&self, config: BatchConfig) -> BatchSender {
        let weak = Arc::downgrade(&self.inner);
        let send: BatchSendFn = Arc::new(move |batch| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return Err(WireError::State("client destroyed".into()));
                };
                ClientInner::wire_send(&inner, Value::Array(batch)).await
            })
        });
        BatchSender::new(config, send)
    }

    // ── routing and events ──────────────────────────────────────────

    /// Register an event listener.
    pub fn on<F>(&self, event: &str, handler: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.bus.on(event, handler)
    }

    /// Register a one-shot event listener.
    pub fn once<F>(&self, event: &str, handler: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.bus.once(event, handler)
    }

    /// Remove one listener, or all listeners for an event.
    pub fn off(&self, event: &str, id: Option<ListenerId>) -> usize {
        self.inner.bus.off(event, id)
    }

    /// Register a message route by `type` pattern.
    pub fn route<F>(&self, pattern: &str, handler: F, priority: i32) -> RouteId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.router.on(pattern, handler, priority)
    }

    /// Register a one-shot route.
    pub fn route_once<F>(&self, pattern: &str, handler: F, priority: i32) -> RouteId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.router.once(pattern, handler, priority)
    }

    /// Remove a route.
    pub fn remove_route(&self, id: RouteId) -> bool {
        self.inner.router.off(id)
    }

    /// Handler for messages no route matches.
    pub fn set_default_route<F>(&self, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.router.set_default(handler)
    }

    /// Open a channel for routing.
    pub fn subscribe(&self, channel: &str) {
        self.inner.router.subscribe(channel)
    }

    /// Open a channel with a dedicated handler.
    pub fn subscribe_with_handler(&self, channel: &str, handler: Option<RouteHandler>) {
        self.inner.router.subscribe_with_handler(channel, handler)
    }

    /// Close a channel.
    pub fn unsubscribe(&self, channel: &str) -> bool {
        self.inner.router.unsubscribe(channel)
    }

    /// Register a middleware on both chains.
    pub fn use_middleware(&self, mw: Arc<dyn Middleware>) {
        self.inner.pipeline.use_both(mw)
    }

    /// Register a middleware on one chain.
    pub fn use_middleware_for(&self, direction: Direction, mw: Arc<dyn Middleware>) {
        match direction {
            Direction::Send => self.inner.pipeline.use_send(mw),
            Direction::Receive => self.inner.pipeline.use_receive(mw),
        }
    }

    // ── observables ─────────────────────────────────────────────────

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state.state()
    }

    /// Whether the state is `connected`.
    pub fn is_connected(&self) -> bool {
        self.inner.state.state() == ConnectionState::Connected
    }

    /// Point-in-time metrics snapshot.
    pub fn metrics(&self) -> Metrics {
        let (len, capacity) = {
            let queue = self.inner.queue.lock().unwrap();
            (queue.len(), self.inner.config.queue.max_size)
        };
        let mut monitor = self.inner.monitor.lock().unwrap();
        monitor.set_queue_usage(len, capacity);
        monitor.metrics()
    }

    /// Human-readable multi-line performance summary.
    pub fn generate_report(&self) -> String {
        self.inner.monitor.lock().unwrap().generate_report()
    }

    /// Number of queued outbound messages.
    pub fn queue_size(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    /// Queue occupancy snapshot.
    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.lock().unwrap().stats()
    }

    /// ACK tracker snapshot.
    pub fn ack_stats(&self) -> AckStats {
        self.inner.acks.stats()
    }

    /// Drop every queued outbound message.
    pub fn clear_queue(&self) {
        self.inner.queue.lock().unwrap().clear()
    }
}

impl ClientInner {
    fn ensure_alive(inner: &Arc<Self>) -> Result<()> {
        if inner.destroyed.load(Ordering::Acquire) {
            return Err(WireError::State("client destroyed".into()));
        }
        Ok(())
    }

    /// Run a state transition and emit `state-change` before returning,
    /// so side effects always trail the event.
    fn transition(inner: &Arc<Self>, next: ConnectionState) -> Result<Transition> {
        let t = inner.state.transition(next)?;
        inner.bus.emit(
            events::STATE_CHANGE,
            &json!({
                "oldState": t.old.as_str(),
                "newState": t.new.as_str(),
                "timestamp": t.timestamp,
            }),
        );
        Ok(t)
    }

    fn current_conn(inner: &Arc<Self>) -> Option<Arc<dyn Connection>> {
        inner
            .conn
            .lock()
            .unwrap()
            .clone()
            .filter(|conn| conn.is_open())
    }

    /// Encode and put one payload on the wire.
    async fn wire_send(inner: &Arc<Self>, payload: Value) -> Result<()> {
        let conn = Self::current_conn(inner)
            .ok_or_else(|| WireError::State("not connected".into()))?;
        let text = inner.codec.encode(&payload)?;
        conn.send_text(text).await?;
        inner.state.with_session(|s| s.messages_sent += 1);
        inner.monitor.lock().unwrap().record_send();
        Ok(())
    }

    /// One connect attempt from the `Connecting` state.
    async fn attempt_connect(inner: &Arc<Self>) -> Result<()> {
        let target = ConnectTarget {
            url: inner.config.url.clone(),
            protocols: inner.config.protocols.clone(),
            headers: inner.config.headers.clone(),
            timeout: inner.config.connection_timeout,
        };

        match inner.transport.connect(&target).await {
            Ok((conn, events)) => {
                // State may have moved while we awaited (cancel, destroy).
                if inner.destroyed.load(Ordering::Acquire)
                    || inner.state.state() != ConnectionState::Connecting
                {
                    let _ = conn.close(Some(1000), Some("superseded".into())).await;
                    return Ok(());
                }
                Self::on_open(inner, conn, events).await;
                Ok(())
            }
            Err(err) => Self::on_connect_failure(inner, err).await,
        }
    }

    /// Shared failure path for initial connects and retries.
    async fn on_connect_failure(inner: &Arc<Self>, err: WireError) -> Result<()> {
        tracing::debug!(%err, "connect attempt failed");
        inner.monitor.lock().unwrap().record_error(err.to_string());

        if !inner.reconnect.enabled() {
            let _ = Self::transition(inner, ConnectionState::Disconnected);
            Self::emit_error(inner, &err);
            return Err(err);
        }

        if inner.state.state() == ConnectionState::Connecting {
            let _ = Self::transition(inner, ConnectionState::Reconnecting);
        }
        {
            let mut started = inner.reconnect_started_at.lock().unwrap();
            started.get_or_insert_with(Instant::now);
        }
        Self::enter_reconnect_loop(inner);
        Ok(())
    }

    /// Schedule the next retry, or give up when the budget is spent.
    fn enter_reconnect_loop(inner: &Arc<Self>) {
        if inner.destroyed.load(Ordering::Acquire) {
            return;
        }
        if inner.reconnect.exhausted() {
            let attempts = inner.reconnect.attempt();
            tracing::warn!(attempts, "reconnect attempts exhausted");
            inner.bus.emit(
                events::RECONNECT_FAILED,
                &json!({
                    "attempts": attempts,
                    "reason": "max reconnect attempts exceeded",
                    "timestamp": now_millis(),
                }),
            );
            let _ = Self::transition(inner, ConnectionState::Disconnected);
            *inner.reconnect_started_at.lock().unwrap() = None;
            return;
        }

        let delay = inner.reconnect.next_delay();
        let attempt = inner.reconnect.record_failure();
        inner.state.with_session(|s| s.current_attempt = attempt);
        inner.bus.emit(
            events::RECONNECTING,
            &json!({
                "attempt": attempt,
                "maxAttempts": inner.reconnect.max_attempts(),
                "delay": delay.as_millis() as u64,
                "timestamp": now_millis(),
            }),
        );

        let weak = Arc::downgrade(inner);
        inner.reconnect.schedule(delay, async move {
            let Some(inner) = weak.upgrade() else { return };
            if inner.destroyed.load(Ordering::Acquire)
                || inner.state.state() != ConnectionState::Reconnecting
            {
                return;
            }
            if Self::transition(&inner, ConnectionState::Connecting).is_err() {
                return;
            }
            let _ = Self::attempt_connect(&inner).await;
        });
    }

    /// Adopt a freshly opened connection.
    async fn on_open(inner: &Arc<Self>, conn: Box<dyn Connection>, events: TransportEvents) {
        let conn: Arc<dyn Connection> = Arc::from(conn);
        let epoch = inner.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        *inner.conn.lock().unwrap() = Some(conn);

        if Self::transition(inner, ConnectionState::Connected).is_err() {
            return;
        }

        // Reconnect bookkeeping before the open event, so listeners see
        // consistent counters.
        let attempts = inner.reconnect.attempt();
        if attempts > 0 {
            let duration_ms = inner
                .reconnect_started_at
                .lock()
                .unwrap()
                .take()
                .map(|at| at.elapsed().as_millis() as u64)
                .unwrap_or(0);
            inner.state.with_session(|s| {
                s.reconnects += 1;
                s.current_attempt = 0;
            });
            inner.monitor.lock().unwrap().record_reconnect();
            inner.bus.emit(
                events::RECONNECTED,
                &json!({
                    "attempts": attempts,
                    "duration": duration_ms,
                    "timestamp": now_millis(),
                }),
            );
        }
        inner.reconnect.record_success();

        Self::spawn_event_loop(inner, events, epoch);

        inner
            .bus
            .emit(events::OPEN, &json!({ "timestamp": now_millis() }));

        Self::start_heartbeat(inner);
        inner.dedup.start_sweeper();

        // Ordering contract: queued traffic flushes only after `open`
        // was observable.
        if inner.config.queue.enabled {
            Self::flush_queue(inner).await;
        }
    }

    /// Drain the offline queue through the wire, stopping at the first
    /// failure.
    async fn flush_queue(inner: &Arc<Self>) {
        let mut delivered = 0usize;
        loop {
            if inner.state.state() != ConnectionState::Connected {
                break;
            }
            let item = inner.queue.lock().unwrap().dequeue();
            let Some(item) = item else { break };
            match Self::wire_send(inner, item.payload.clone()).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::debug!(%err, "queue flush interrupted");
                    if let Err(err) = inner.queue.lock().unwrap().requeue(item) {
                        tracing::warn!(%err, "could not re-enqueue after failed flush");
                    }
                    break;
                }
            }
        }
        if delivered > 0 {
            tracing::debug!(delivered, "flushed offline queue");
        }
        let depth = inner.queue.lock().unwrap().len();
        inner.state.with_session(|s| s.queue_depth = depth);
    }

    fn spawn_event_loop(inner: &Arc<Self>, mut events: TransportEvents, epoch: u64) {
        let weak = Arc::downgrade(inner);
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                if inner.destroyed.load(Ordering::Acquire)
                    || inner.epoch.load(Ordering::Acquire) != epoch
                {
                    break;
                }
                match event {
                    TransportEvent::Open => {}
                    TransportEvent::Message(Incoming::Text(text)) => {
                        Self::on_inbound_text(&inner, &text).await;
                    }
                    TransportEvent::Message(Incoming::Binary(data)) => {
                        Self::on_inbound_binary(&inner, data);
                    }
                    TransportEvent::Error(message) => {
                        inner.monitor.lock().unwrap().record_error(message.clone());
                        inner.bus.emit(
                            events::ERROR,
                            &json!({ "error": message, "timestamp": now_millis() }),
                        );
                    }
                    TransportEvent::Close {
                        code,
                        reason,
                        was_clean,
                    } => {
                        Self::on_close(&inner, code, reason, was_clean).await;
                        break;
                    }
                }
            }
        });

        let mut slot = inner.conn_task.lock().unwrap();
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
    }

    async fn on_inbound_text(inner: &Arc<Self>, text: &str) {
        let value = match inner.codec.decode(text) {
            Ok(value) => value,
            Err(err) => {
                inner.monitor.lock().unwrap().record_error(err.to_string());
                Self::emit_error(inner, &err);
                return;
            }
        };

        inner.state.with_session(|s| s.messages_received += 1);
        inner.monitor.lock().unwrap().record_receive();

        let mut ctx = MiddlewareContext::new(value, Direction::Receive);
        if let Err(err) = inner.pipeline.execute(&mut ctx).await {
            inner.monitor.lock().unwrap().record_error(err.to_string());
            Self::emit_error(inner, &err);
            return;
        }
        if ctx.should_skip {
            return;
        }
        let value = ctx.data;

        // Classification: pong → heartbeat, ack → tracker,
        // rpc response → correlator, everything else → routing.
        if inner.heartbeat.is_pong(&value) {
            inner.heartbeat.handle_pong();
            inner
                .bus
                .emit(events::PONG, &json!({ "timestamp": now_millis() }));
            return;
        }

        if value.get("type").and_then(Value::as_str) == Some("ack") {
            if let Some(id) = value.get("id").and_then(Value::as_str) {
                inner.acks.handle_ack(id, value.get("data").cloned());
                return;
            }
        }

        if RpcCorrelator::is_response(&value) {
            inner.rpc.handle_response(&value);
            return;
        }

        if inner.dedup.is_duplicate(&value) {
            tracing::debug!("dropped duplicate inbound message");
            return;
        }
        inner.dedup.mark_processed(&value);

        inner.router.dispatch(&value);
        inner.bus.emit(
            events::MESSAGE,
            &json!({ "data": value, "timestamp": now_millis() }),
        );
    }

    fn on_inbound_binary(inner: &Arc<Self>, data: Bytes) {
        inner.state.with_session(|s| s.messages_received += 1);
        inner.monitor.lock().unwrap().record_receive();
        inner.bus.emit(
            events::MESSAGE,
            &json!({
                "binary": true,
                "size": data.len(),
                "timestamp": now_millis(),
            }),
        );
    }

    async fn on_close(inner: &Arc<Self>, code: Option<u16>, reason: String, was_clean: bool) {
        tracing::debug!(?code, %reason, was_clean, "connection closed");
        Self::teardown_session(inner);

        inner.bus.emit(
            events::CLOSE,
            &json!({
                "code": code,
                "reason": reason,
                "wasClean": was_clean,
                "timestamp": now_millis(),
            }),
        );

        match inner.state.state() {
            ConnectionState::Disconnecting => {
                let _ = Self::transition(inner, ConnectionState::Disconnected);
            }
            ConnectionState::Connected => {
                if !was_clean && inner.reconnect.enabled() {
                    let _ = Self::transition(inner, ConnectionState::Reconnecting);
                    inner
                        .reconnect_started_at
                        .lock()
                        .unwrap()
                        .get_or_insert_with(Instant::now);
                    Self::enter_reconnect_loop(inner);
                } else {
                    let _ = Self::transition(inner, ConnectionState::Disconnected);
                }
            }
            _ => {}
        }
    }

    /// Stop per-session machinery and reject in-flight work.
    fn teardown_session(inner: &Arc<Self>) {
        inner.heartbeat.stop();
        *inner.conn.lock().unwrap() = None;
        inner.acks.cancel_all();
        inner.rpc.cancel_all("connection lost");
    }

    fn start_heartbeat(inner: &Arc<Self>) {
        let probe_weak = Arc::downgrade(inner);
        let probe = Arc::new(move |message: Value| {
            let weak = probe_weak.clone();
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return Err(WireError::State("client destroyed".into()));
                };
                inner.bus.emit(
                    events::PING,
                    &json!({ "message": message, "timestamp": now_millis() }),
                );
                Self::wire_send(&inner, message).await
            }) as crate::BoxFuture<'static, Result<()>>
        });

        let latency_weak = Arc::downgrade(inner);
        let on_latency = Arc::new(move |sample: f64| {
            if let Some(inner) = latency_weak.upgrade() {
                inner.state.with_session(|s| s.record_latency(sample));
                inner.monitor.lock().unwrap().record_latency(sample);
            }
        });

        let timeout_weak = Arc::downgrade(inner);
        let on_timeout = Arc::new(move || {
            let Some(inner) = timeout_weak.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                Self::on_heartbeat_timeout(&inner).await;
            });
        });

        inner.heartbeat.start(probe, on_latency, on_timeout);
    }

    /// Heartbeat declared the peer dead: close 4001 and, when
    /// configured, reconnect.
    async fn on_heartbeat_timeout(inner: &Arc<Self>) {
        if inner.destroyed.load(Ordering::Acquire)
            || inner.state.state() != ConnectionState::Connected
        {
            return;
        }
        tracing::warn!("heartbeat timeout, dropping connection");
        inner
            .monitor
            .lock()
            .unwrap()
            .record_error("heartbeat timeout");

        // Invalidate the event loop before closing so the transport's
        // own close event cannot double-drive the state machine.
        inner.epoch.fetch_add(1, Ordering::AcqRel);
        let conn = inner.conn.lock().unwrap().take();
        if let Some(conn) = conn {
            let _ = conn
                .close(Some(HEARTBEAT_CLOSE_CODE), Some("heartbeat timeout".into()))
                .await;
        }
        Self::teardown_session(inner);
        inner.bus.emit(
            events::CLOSE,
            &json!({
                "code": HEARTBEAT_CLOSE_CODE,
                "reason": "heartbeat timeout",
                "wasClean": false,
                "timestamp": now_millis(),
            }),
        );

        if inner.reconnect.enabled() {
            let _ = Self::transition(inner, ConnectionState::Reconnecting);
            inner
                .reconnect_started_at
                .lock()
                .unwrap()
                .get_or_insert_with(Instant::now);
            Self::enter_reconnect_loop(inner);
        } else {
            let _ = Self::transition(inner, ConnectionState::Disconnected);
        }
    }

    async fn disconnect(inner: &Arc<Self>, code: Option<u16>, reason: Option<String>) {
        inner.reconnect.cancel();
        inner.heartbeat.stop();

        let state = inner.state.state();
        match state {
            ConnectionState::Connected => {
                let _ = Self::transition(inner, ConnectionState::Disconnecting);
            }
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                let _ = Self::transition(inner, ConnectionState::Disconnected);
            }
            _ => {}
        }

        // Invalidate the event loop; this path owns the close event.
        inner.epoch.fetch_add(1, Ordering::AcqRel);
        let conn = inner.conn.lock().unwrap().take();
        if let Some(conn) = conn {
            let _ = conn.close(code, reason.clone()).await;
        }
        inner.acks.cancel_all();
        inner.rpc.cancel_all("connection lost");

        if state == ConnectionState::Connected {
            inner.bus.emit(
                events::CLOSE,
                &json!({
                    "code": code.unwrap_or(1000),
                    "reason": reason.unwrap_or_default(),
                    "wasClean": true,
                    "timestamp": now_millis(),
                }),
            );
            let _ = Self::transition(inner, ConnectionState::Disconnected);
        }
        *inner.reconnect_started_at.lock().unwrap() = None;
    }

    async fn destroy(inner: &Arc<Self>) {
        if inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("destroying client");

        inner.reconnect.reset();
        inner.heartbeat.stop();
        inner.dedup.stop_sweeper();
        inner.dedup.clear();

        inner.epoch.fetch_add(1, Ordering::AcqRel);
        if let Some(task) = inner.conn_task.lock().unwrap().take() {
            task.abort();
        }
        let conn = inner.conn.lock().unwrap().take();
        if let Some(conn) = conn {
            let _ = conn.close(Some(1000), Some("client destroyed".into())).await;
        }

        inner.acks.cancel_all();
        inner.rpc.cancel_all("client destroyed");
        inner.queue.lock().unwrap().clear();

        let _ = Self::transition(inner, ConnectionState::Destroyed);
        inner.bus.remove_all();
    }

    fn emit_error(inner: &Arc<Self>, err: &WireError) {
        inner.bus.emit(
            events::ERROR,
            &json!({ "error": err.to_string(), "timestamp": now_millis() }),
        );
    }
}

impl Drop for WireClient {
    fn drop(&mut self) {
        // Best-effort teardown for clients dropped without destroy:
        // stop timers so no task outlives the facade. The async close
        // handshake is destroy's business.
        self.inner.destroyed.store(true, Ordering::Release);
        self.inner.reconnect.cancel();
        self.inner.heartbeat.stop();
        self.inner.dedup.stop_sweeper();
        if let Some(task) = self.inner.conn_task.lock().unwrap().take() {
            task.abort();
        }
    }
}
