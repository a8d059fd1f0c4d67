//! Client configuration trees.
//!
//! Each subsystem reads an immutable snapshot of its own tree. The
//! snapshots are plain data: cloning a [`ClientConfig`] and handing the
//! pieces out at build time is the whole configuration story. Updates
//! after construction take effect only where a subsystem documents a
//! reload point (the heartbeat controller requires an explicit restart).

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Which transport implementation the client opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// tokio-tungstenite WebSocket (default).
    Native,
    /// In-process pair transport, for tests and demos.
    Pair,
}

impl Default for AdapterKind {
    fn default() -> Self {
        AdapterKind::Native
    }
}

/// Reconnect backoff configuration.
///
/// Delay for zero-indexed attempt `n` is
/// `min(max_delay, delay * factor^n)` plus uniform jitter from
/// `[-j, +j]` where `j = capped_delay * jitter`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Whether unclean closes trigger automatic reconnection.
    pub enabled: bool,
    /// Base delay for the first attempt.
    pub delay: Duration,
    /// Cap applied to the exponential delay.
    pub max_delay: Duration,
    /// Attempts before giving up; 0 means unbounded.
    pub max_attempts: u32,
    /// Exponential growth factor.
    pub factor: f64,
    /// Jitter fraction of the capped delay, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 0,
            factor: 2.0,
            jitter: 0.1,
        }
    }
}

/// Heartbeat probe configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Whether liveness probing runs while connected.
    pub enabled: bool,
    /// Interval between probes.
    pub interval: Duration,
    /// How long to wait for a pong before declaring the peer dead.
    pub timeout: Duration,
    /// The probe payload sent on each tick.
    pub message: Value,
    /// Inbound messages whose `type` equals this are pongs.
    pub pong_type: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            message: json!({"type": "ping"}),
            pong_type: "pong".to_string(),
        }
    }
}

/// Offline queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Whether sends while disconnected are buffered.
    pub enabled: bool,
    /// Maximum number of queued items before eviction.
    pub max_size: usize,
    /// Per-message serialized-size cap in bytes.
    pub max_message_bytes: usize,
    /// Whether the queue mirrors itself into the key/value store.
    pub persistent: bool,
    /// Storage key used when `persistent` is set.
    pub storage_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 1_000,
            max_message_bytes: 1024 * 1024,
            persistent: false,
            storage_key: "durawire:queue".to_string(),
        }
    }
}

/// Authenticated-encryption algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionAlgorithm {
    /// AES-256-GCM with a 12-byte IV.
    Aes256Gcm,
}

impl Default for EncryptionAlgorithm {
    fn default() -> Self {
        EncryptionAlgorithm::Aes256Gcm
    }
}

/// Payload encryption configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Whether outbound payloads are encrypted.
    pub enabled: bool,
    /// Which AEAD to use.
    pub algorithm: EncryptionAlgorithm,
    /// 32-byte key. Required when `enabled`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<Vec<u8>>,
    /// Optional fixed 12-byte IV. Discouraged; a fresh random IV per
    /// message is used when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<Vec<u8>>,
}

/// Compression algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    Gzip,
    Deflate,
    /// Maps to zlib-deflate; kept as a distinct name so configs naming a
    /// fallback keep working.
    Fallback,
}

impl Default for CompressionAlgorithm {
    fn default() -> Self {
        CompressionAlgorithm::Gzip
    }
}

/// Payload compression configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Whether large payloads are compressed before (optional) encryption.
    pub enabled: bool,
    /// Minimum serialized size, in bytes, before compression applies.
    pub threshold: usize,
    /// Which compressor to use.
    pub algorithm: CompressionAlgorithm,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 1_024,
            algorithm: CompressionAlgorithm::Gzip,
        }
    }
}

/// Top-level client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Transport endpoint, e.g. `wss://example.com/socket`.
    pub url: String,
    /// Subprotocols forwarded to the transport handshake.
    #[serde(default)]
    pub protocols: Vec<String>,
    /// Transport variant.
    #[serde(default)]
    pub adapter: AdapterKind,
    /// Deadline for a single connect attempt.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: Duration,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    /// Raises the verbosity of the client's own diagnostics.
    #[serde(default)]
    pub debug: bool,
    /// Extra headers applied to the handshake when the transport
    /// supports them.
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(10)
}

impl ClientConfig {
    /// Create a config for the given URL with every subsystem at its
    /// defaults.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            protocols: Vec::new(),
            adapter: AdapterKind::default(),
            connection_timeout: default_connection_timeout(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            queue: QueueConfig::default(),
            encryption: EncryptionConfig::default(),
            compression: CompressionConfig::default(),
            debug: false,
            headers: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("ws://localhost:9000");
        assert_eq!(config.url, "ws://localhost:9000");
        assert_eq!(config.adapter, AdapterKind::Native);
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert!(config.reconnect.enabled);
        assert_eq!(config.reconnect.max_attempts, 0);
        assert!(config.heartbeat.enabled);
        assert_eq!(config.heartbeat.pong_type, "pong");
        assert!(config.queue.enabled);
        assert!(!config.queue.persistent);
        assert!(!config.encryption.enabled);
        assert!(!config.compression.enabled);
    }

    #[test]
    fn test_heartbeat_default_probe() {
        let hb = HeartbeatConfig::default();
        assert_eq!(hb.message, json!({"type": "ping"}));
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let config = ClientConfig::new("wss://example.com/ws");
        let text = serde_json::to_string(&config).unwrap();
        let back: ClientConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.url, config.url);
        assert_eq!(back.reconnect.factor, config.reconnect.factor);
        assert_eq!(back.queue.storage_key, config.queue.storage_key);
    }

    #[test]
    fn test_minimal_json_fills_defaults() {
        let back: ClientConfig = serde_json::from_str(r#"{"url":"ws://x"}"#).unwrap();
        assert_eq!(back.url, "ws://x");
        assert!(back.reconnect.enabled);
        assert_eq!(back.compression.threshold, 1_024);
    }
}
