//! Transport adapter boundary.
//!
//! The runtime talks to a socket through two capability traits:
//! [`Transport`] opens connections, [`Connection`] sends on one. Events
//! from the socket arrive on an unbounded receiver handed back by
//! `connect`, which resolves only once the socket is open. A close or
//! error during the handshake is a connect *failure*, not a normal
//! close.
//!
//! Two implementations ship in-crate: [`NativeTransport`] wraps a
//! tokio-tungstenite WebSocket, [`PairTransport`] is an in-process
//! duplex used by tests and demos. Anything else plugs in through the
//! same traits.

mod native;
mod pair;

pub use native::NativeTransport;
pub use pair::{pair, PairFrame, PairPeer, PairTransport};

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::BoxFuture;

/// An inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
    Text(String),
    Binary(Bytes),
}

/// Events a live connection reports to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The socket is open. Emitted once, before any other event.
    Open,
    Message(Incoming),
    /// Transport-level error; a close usually follows.
    Error(String),
    Close {
        code: Option<u16>,
        reason: String,
        /// Whether the close completed a proper closing handshake.
        was_clean: bool,
    },
}

/// Receiver half of a connection's event stream.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Everything a transport needs to open one connection.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub url: String,
    /// Subprotocols offered in the handshake.
    pub protocols: Vec<String>,
    /// Extra handshake headers, where supported.
    pub headers: HashMap<String, String>,
    /// Deadline for the whole connect attempt.
    pub timeout: Duration,
}

/// Factory for connections.
pub trait Transport: Send + Sync {
    /// Open a socket to `target`.
    ///
    /// Resolves once the socket is open, with the send half and the
    /// event stream. Fails with [`WireError::Connection`] when no
    /// socket opens within `target.timeout`.
    ///
    /// [`WireError::Connection`]: crate::WireError::Connection
    fn connect<'a>(
        &'a self,
        target: &'a ConnectTarget,
    ) -> BoxFuture<'a, Result<(Box<dyn Connection>, TransportEvents)>>;
}

/// Send half of one open socket.
pub trait Connection: Send + Sync {
    /// Send a text frame. Fails with a state error once the socket is
    /// no longer open.
    fn send_text(&self, text: String) -> BoxFuture<'_, Result<()>>;

    /// Send a binary frame, passed through unchanged.
    fn send_binary(&self, data: Bytes) -> BoxFuture<'_, Result<()>>;

    /// Start a close handshake.
    fn close(&self, code: Option<u16>, reason: Option<String>) -> BoxFuture<'_, Result<()>>;

    /// Whether the socket is still open.
    fn is_open(&self) -> bool;
}
