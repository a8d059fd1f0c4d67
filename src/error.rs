//! Error types for durawire.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all durawire operations.
#[derive(Debug, Error)]
pub enum WireError {
    /// The transport refused or failed to open a socket.
    #[error("connection error: {0}")]
    Connection(String),

    /// An operation exceeded its configured deadline.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Which operation timed out (connect, heartbeat, ack, rpc).
        operation: String,
        /// The configured deadline that elapsed.
        timeout: Duration,
    },

    /// Malformed inbound data or a schema violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Enqueue would exceed queue capacity and no item could be evicted.
    #[error("queue full: {0}")]
    QueueFull(String),

    /// Key errors or authentication-tag verification failure.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// Decompression failure or corrupt compressed payload.
    #[error("compression error: {0}")]
    Compression(String),

    /// Operation attempted in the wrong connection state.
    #[error("invalid state: {0}")]
    State(String),

    /// Transport-reported authentication failure.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// A single payload exceeds the per-message size cap.
    #[error("message of {size} bytes exceeds limit of {limit} bytes")]
    MessageSize { size: usize, limit: usize },

    /// JSON serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error from the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Whether retrying the failed operation can reasonably succeed.
    ///
    /// Connection, timeout, and I/O failures are transient; everything
    /// else indicates a bug, a config error, or corrupt data.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WireError::Connection(_) | WireError::Timeout { .. } | WireError::Io(_)
        )
    }

    /// Shorthand for a [`WireError::Timeout`] with a named operation.
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        WireError::Timeout {
            operation: operation.into(),
            timeout,
        }
    }
}

/// Result type alias using WireError.
pub type Result<T> = std::result::Result<T, WireError>;
