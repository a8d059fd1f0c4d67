//! # durawire
//!
//! Resilient client-side WebSocket runtime.
//!
//! `durawire` turns an unreliable bidirectional transport into a
//! reliable, observable application channel: a connection state machine
//! with automatic reconnection (exponential backoff with jitter),
//! heartbeat liveness probing, a priority-ordered offline queue with
//! optional persistence, an onion-model middleware pipeline, a codec
//! chain (compression + authenticated encryption), and reliability
//! overlays for at-least-once delivery, request/response correlation,
//! duplicate suppression, batching, routing, and quality telemetry.
//!
//! ## Architecture
//!
//! ```text
//! send ──► middleware ──► codec ──► adapter ──► wire
//!                            ▲
//! queue (offline buffer) ────┘        wire ──► adapter ──► codec
//!                                             ──► middleware ──► classify
//!                                                 pong → heartbeat
//!                                                 ack  → ack tracker
//!                                                 rpc  → correlator
//!                                                 else → dedup → router
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use durawire::{ClientConfig, WireClient, SendOptions, events};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> durawire::Result<()> {
//!     let client = WireClient::new("wss://example.com/socket")?;
//!
//!     client.on(events::MESSAGE, |data| {
//!         println!("inbound: {data}");
//!     });
//!
//!     client.connect().await?;
//!     client.send(json!({"type": "hello"}), SendOptions::default()).await?;
//!
//!     let answer = client.request(json!({"op": "sum", "args": [1, 2]}), None).await?;
//!     println!("sum = {answer}");
//!
//!     client.destroy().await;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod ack;
pub mod adapter;
pub mod batch;
pub mod codec;
pub mod config;
pub mod dedup;
pub mod error;
pub mod event;
pub mod heartbeat;
pub mod middleware;
pub mod monitor;
pub mod queue;
pub mod reconnect;
pub mod router;
pub mod rpc;
pub mod state;
pub mod storage;

mod client;
mod id;

pub use ack::{AckOptions, AckStats};
pub use batch::{BatchConfig, BatchSender};
pub use client::{events, ClientBuilder, SendOptions, WireClient, HEARTBEAT_CLOSE_CODE};
pub use config::{
    AdapterKind, ClientConfig, CompressionAlgorithm, CompressionConfig, EncryptionAlgorithm,
    EncryptionConfig, HeartbeatConfig, QueueConfig, ReconnectConfig,
};
pub use error::{Result, WireError};
pub use event::ListenerId;
pub use monitor::Metrics;
pub use queue::Priority;
pub use router::RouteId;
pub use state::ConnectionState;
pub use storage::{KeyValueStore, MemoryStore, StoreError};

/// Boxed future alias used across subsystem callback seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
