//! In-process pair transport.
//!
//! A [`PairTransport`] connects to its [`PairPeer`] over channels
//! instead of a socket. The peer plays the remote endpoint: it reads
//! what the client sent, injects inbound frames, closes uncleanly, and
//! can refuse or stall upcoming connect attempts. Tests and demos run
//! the whole runtime against it; it also stands in for any higher-level
//! socket wrapper a deployment might adapt.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{ConnectTarget, Connection, Incoming, Transport, TransportEvent, TransportEvents};
use crate::error::{Result, WireError};
use crate::BoxFuture;

/// A frame the client side sent to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairFrame {
    Text(String),
    Binary(Bytes),
    /// The client started a close handshake.
    Close { code: Option<u16>, reason: String },
}

struct PairShared {
    /// Connect attempts to refuse before accepting again.
    refuse: AtomicU32,
    /// Artificial delay before a connect resolves.
    connect_delay: Mutex<Option<Duration>>,
    /// Total accepted connects.
    accepted: AtomicU32,
    /// Frames sent by the client, across all links.
    outbound: Mutex<VecDeque<PairFrame>>,
    outbound_signal: tokio::sync::Notify,
    /// Event sender of the current link, for injecting inbound traffic.
    current: Mutex<Option<LinkEnd>>,
}

struct LinkEnd {
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    open: Arc<AtomicBool>,
}

/// Client-side half; implements [`Transport`].
pub struct PairTransport {
    shared: Arc<PairShared>,
}

/// Remote-side half driven by tests.
pub struct PairPeer {
    shared: Arc<PairShared>,
}

/// Create a connected transport/peer pair.
pub fn pair() -> (PairTransport, PairPeer) {
    let shared = Arc::new(PairShared {
        refuse: AtomicU32::new(0),
        connect_delay: Mutex::new(None),
        accepted: AtomicU32::new(0),
        outbound: Mutex::new(VecDeque::new()),
        outbound_signal: tokio::sync::Notify::new(),
        current: Mutex::new(None),
    });
    (
        PairTransport {
            shared: shared.clone(),
        },
        PairPeer { shared },
    )
}

impl PairTransport {
    /// Convenience for demos: a transport whose peer is discarded (the
    /// link accepts traffic and answers nothing).
    pub fn detached() -> Self {
        pair().0
    }
}

impl Transport for PairTransport {
    fn connect<'a>(
        &'a self,
        target: &'a ConnectTarget,
    ) -> BoxFuture<'a, Result<(Box<dyn Connection>, TransportEvents)>> {
        Box::pin(async move {
            let delay = *self.shared.connect_delay.lock().unwrap();
            if let Some(delay) = delay {
                if delay >= target.timeout {
                    tokio::time::sleep(target.timeout).await;
                    return Err(WireError::timeout("connect", target.timeout));
                }
                tokio::time::sleep(delay).await;
            }

            let refusals = self.shared.refuse.load(Ordering::Acquire);
            if refusals > 0 {
                self.shared.refuse.store(refusals - 1, Ordering::Release);
                return Err(WireError::Connection("pair peer refused connect".into()));
            }

            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let open = Arc::new(AtomicBool::new(true));
            *self.shared.current.lock().unwrap() = Some(LinkEnd {
                event_tx: event_tx.clone(),
                open: open.clone(),
            });
            self.shared.accepted.fetch_add(1, Ordering::AcqRel);

            let _ = event_tx.send(TransportEvent::Open);

            let connection = PairConnection {
                shared: self.shared.clone(),
                event_tx,
                open,
            };
            Ok((Box::new(connection) as Box<dyn Connection>, event_rx))
        })
    }
}

struct PairConnection {
    shared: Arc<PairShared>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    open: Arc<AtomicBool>,
}

impl PairConnection {
    fn push(&self, frame: PairFrame) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(WireError::State("socket is not open".into()));
        }
        self.shared.outbound.lock().unwrap().push_back(frame);
        self.shared.outbound_signal.notify_waiters();
        Ok(())
    }
}

impl Connection for PairConnection {
    fn send_text(&self, text: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.push(PairFrame::Text(text)) })
    }

    fn send_binary(&self, data: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.push(PairFrame::Binary(data)) })
    }

    fn close(&self, code: Option<u16>, reason: Option<String>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.open.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            let reason = reason.unwrap_or_default();
            let _ = self.push_close(code, reason.clone());
            let _ = self.event_tx.send(TransportEvent::Close {
                code,
                reason,
                was_clean: true,
            });
            Ok(())
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl PairConnection {
    fn push_close(&self, code: Option<u16>, reason: String) -> Result<()> {
        self.shared
            .outbound
            .lock()
            .unwrap()
            .push_back(PairFrame::Close { code, reason });
        self.shared.outbound_signal.notify_waiters();
        Ok(())
    }
}

impl PairPeer {
    /// Next frame the client sent, waiting until one arrives.
    pub async fn recv(&self) -> PairFrame {
        loop {
            // Register interest before checking, so a frame pushed in
            // between is not missed.
            let notified = self.shared.outbound_signal.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(frame) = self.shared.outbound.lock().unwrap().pop_front() {
                return frame;
            }
            notified.await;
        }
    }

    /// Next frame if one is already buffered.
    pub fn try_recv(&self) -> Option<PairFrame> {
        self.shared.outbound.lock().unwrap().pop_front()
    }

    /// Inject an inbound text frame.
    pub fn send_text(&self, text: impl Into<String>) {
        self.inject(TransportEvent::Message(Incoming::Text(text.into())));
    }

    /// Inject an inbound JSON value.
    pub fn send_json(&self, value: &serde_json::Value) {
        self.send_text(value.to_string());
    }

    /// Inject an inbound binary frame.
    pub fn send_binary(&self, data: Bytes) {
        self.inject(TransportEvent::Message(Incoming::Binary(data)));
    }

    /// Inject a transport error.
    pub fn send_error(&self, message: impl Into<String>) {
        self.inject(TransportEvent::Error(message.into()));
    }

    /// Close the current link from the remote side.
    pub fn close(&self, code: Option<u16>, reason: impl Into<String>, was_clean: bool) {
        let guard = self.shared.current.lock().unwrap();
        if let Some(link) = guard.as_ref() {
            link.open.store(false, Ordering::Release);
            let _ = link.event_tx.send(TransportEvent::Close {
                code,
                reason: reason.into(),
                was_clean,
            });
        }
    }

    fn inject(&self, event: TransportEvent) {
        let guard = self.shared.current.lock().unwrap();
        if let Some(link) = guard.as_ref() {
            let _ = link.event_tx.send(event);
        }
    }

    /// Refuse the next `n` connect attempts.
    pub fn refuse_next(&self, n: u32) {
        self.shared.refuse.store(n, Ordering::Release);
    }

    /// Stall every connect by `delay`; a delay at or past the connect
    /// timeout makes attempts time out.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.shared.connect_delay.lock().unwrap() = delay;
    }

    /// Connect attempts accepted so far.
    pub fn accepted_connects(&self) -> u32 {
        self.shared.accepted.load(Ordering::Acquire)
    }

    /// Buffered client frames not yet read.
    pub fn pending_frames(&self) -> usize {
        self.shared.outbound.lock().unwrap().len()
    }
}
