//! Native WebSocket transport on tokio-tungstenite.
//!
//! `connect` performs the handshake under the target's deadline, then
//! splits the stream: a write loop drains an mpsc channel into the
//! sink, a read loop turns frames into [`TransportEvent`]s. Ping/pong
//! control frames are handled by the library; only application frames
//! reach the runtime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use super::{ConnectTarget, Connection, Incoming, Transport, TransportEvent, TransportEvents};
use crate::error::{Result, WireError};
use crate::BoxFuture;

/// Transport variant wrapping a standards-compliant WebSocket client.
#[derive(Debug, Default)]
pub struct NativeTransport;

impl NativeTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for NativeTransport {
    fn connect<'a>(
        &'a self,
        target: &'a ConnectTarget,
    ) -> BoxFuture<'a, Result<(Box<dyn Connection>, TransportEvents)>> {
        Box::pin(async move {
            let mut request = target
                .url
                .as_str()
                .into_client_request()
                .map_err(|e| WireError::Connection(format!("invalid url: {e}")))?;

            if !target.protocols.is_empty() {
                let value = HeaderValue::from_str(&target.protocols.join(", "))
                    .map_err(|e| WireError::Connection(format!("invalid protocols: {e}")))?;
                request
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", value);
            }
            for (name, value) in &target.headers {
                let name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| WireError::Connection(format!("invalid header name: {e}")))?;
                let value = HeaderValue::from_str(value)
                    .map_err(|e| WireError::Connection(format!("invalid header value: {e}")))?;
                request.headers_mut().insert(name, value);
            }

            let handshake = tokio::time::timeout(target.timeout, connect_async(request))
                .await
                .map_err(|_| WireError::timeout("connect", target.timeout))?;
            let (stream, _response) = handshake.map_err(map_handshake_error)?;

            let (mut sink, mut source) = stream.split();
            let (event_tx, event_rx) = mpsc::unbounded_channel();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
            let open = Arc::new(AtomicBool::new(true));

            // Write loop: ends when the connection handle is dropped.
            let write_open = open.clone();
            tokio::spawn(async move {
                while let Some(message) = out_rx.recv().await {
                    if let Err(err) = sink.send(message).await {
                        tracing::debug!(%err, "websocket write failed");
                        write_open.store(false, Ordering::Release);
                        break;
                    }
                }
            });

            // Read loop: frames become events; ending the loop closes
            // the session.
            let read_open = open.clone();
            let read_events = event_tx.clone();
            tokio::spawn(async move {
                let mut close: Option<(Option<u16>, String, bool)> = None;
                while let Some(item) = source.next().await {
                    match item {
                        Ok(Message::Text(text)) => {
                            let _ = read_events
                                .send(TransportEvent::Message(Incoming::Text(text.to_string())));
                        }
                        Ok(Message::Binary(data)) => {
                            let _ = read_events.send(TransportEvent::Message(Incoming::Binary(
                                Bytes::from(data),
                            )));
                        }
                        Ok(Message::Close(frame)) => {
                            let (code, reason) = match frame {
                                Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                                None => (None, String::new()),
                            };
                            close = Some((code, reason, true));
                            break;
                        }
                        Ok(_) => {} // ping/pong/raw frames
                        Err(err) => {
                            let _ = read_events.send(TransportEvent::Error(err.to_string()));
                            close = Some((None, err.to_string(), false));
                            break;
                        }
                    }
                }
                let was_locally_closed = !read_open.swap(false, Ordering::AcqRel);
                let (code, reason, was_clean) =
                    close.unwrap_or((None, "connection lost".to_string(), was_locally_closed));
                let _ = read_events.send(TransportEvent::Close {
                    code,
                    reason,
                    was_clean,
                });
            });

            let _ = event_tx.send(TransportEvent::Open);

            let connection = NativeConnection { out_tx, open };
            Ok((Box::new(connection) as Box<dyn Connection>, event_rx))
        })
    }
}

fn map_handshake_error(err: WsError) -> WireError {
    match err {
        WsError::Http(response) if response.status() == 401 || response.status() == 403 => {
            WireError::Authentication(format!("handshake rejected: {}", response.status()))
        }
        other => WireError::Connection(other.to_string()),
    }
}

struct NativeConnection {
    out_tx: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

impl NativeConnection {
    fn dispatch(&self, message: Message) -> Result<()> {
        if !self.is_open() {
            return Err(WireError::State("socket is not open".into()));
        }
        self.out_tx
            .send(message)
            .map_err(|_| WireError::Connection("socket closed".into()))
    }
}

impl Connection for NativeConnection {
    fn send_text(&self, text: String) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.dispatch(Message::Text(text)) })
    }

    fn send_binary(&self, data: Bytes) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.dispatch(Message::Binary(data.to_vec())) })
    }

    fn close(&self, code: Option<u16>, reason: Option<String>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.open.swap(false, Ordering::AcqRel) {
                return Ok(());
            }
            let frame = CloseFrame {
                code: CloseCode::from(code.unwrap_or(1000)),
                reason: reason.unwrap_or_default().into(),
            };
            self.out_tx
                .send(Message::Close(Some(frame)))
                .map_err(|_| WireError::Connection("socket closed".into()))
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}
