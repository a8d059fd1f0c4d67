//! Connection state machine and session counters.
//!
//! The machine owns the lifecycle state; every accepted transition emits
//! a `state-change` notification *before* the caller can run any
//! state-dependent side effect. Invalid edges are rejected with a
//! [`WireError::State`] instead of silently corrupting the lifecycle.

use std::sync::Mutex;
use std::time::Instant;

use serde::Serialize;

use crate::error::{Result, WireError};
use crate::id::now_millis;

/// Lifecycle state of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
    /// Terminal: entered by `destroy`, never left.
    Destroyed,
}

impl ConnectionState {
    /// Stable lowercase name used in events and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Destroyed => "destroyed",
        }
    }

    /// Whether the edge `self -> next` is part of the lifecycle diagram.
    fn allows(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        if next == Destroyed {
            return *self != Destroyed;
        }
        matches!(
            (*self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Reconnecting)
                | (Connected, Disconnecting)
                | (Connected, Disconnected)
                | (Connected, Reconnecting)
                | (Disconnecting, Disconnected)
                | (Reconnecting, Connecting)
                | (Reconnecting, Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weight of the newest sample in the latency moving average.
const LATENCY_EMA_ALPHA: f64 = 0.2;

/// Counters and health data for one logical client lifetime.
///
/// Counters survive reconnects; a fresh connect from `Disconnected`
/// starts a new session.
#[derive(Debug, Clone)]
pub struct Session {
    /// When the session opened.
    pub started_at: Instant,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Completed reconnects within this client lifetime.
    pub reconnects: u32,
    /// Zero when connected; the in-progress attempt number otherwise.
    pub current_attempt: u32,
    /// Exponential moving average of heartbeat round-trips, milliseconds.
    pub avg_latency_ms: f64,
    /// Wall-clock of the last observed heartbeat pong (ms since epoch).
    pub last_heartbeat: Option<u64>,
    /// Mirror of the outbox depth, updated by the facade.
    pub queue_depth: usize,
}

impl Session {
    fn new() -> Self {
        Self {
            started_at: Instant::now(),
            messages_sent: 0,
            messages_received: 0,
            reconnects: 0,
            current_attempt: 0,
            avg_latency_ms: 0.0,
            last_heartbeat: None,
            queue_depth: 0,
        }
    }

    /// Fold a heartbeat round-trip sample into the moving average.
    pub fn record_latency(&mut self, sample_ms: f64) {
        self.last_heartbeat = Some(now_millis());
        if self.avg_latency_ms == 0.0 {
            self.avg_latency_ms = sample_ms;
        } else {
            self.avg_latency_ms =
                self.avg_latency_ms * (1.0 - LATENCY_EMA_ALPHA) + sample_ms * LATENCY_EMA_ALPHA;
        }
    }
}

/// A completed transition, handed to the caller for event emission.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    pub old: ConnectionState,
    pub new: ConnectionState,
    /// Milliseconds since the Unix epoch at the moment of change.
    pub timestamp: u64,
}

/// Owner of the connection state and session counters.
pub struct StateMachine {
    state: Mutex<ConnectionState>,
    session: Mutex<Session>,
}

impl StateMachine {
    /// New machine in `Disconnected` with a fresh session.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Disconnected),
            session: Mutex::new(Session::new()),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// Attempt the edge `current -> next`.
    ///
    /// The caller must emit `state-change` from the returned
    /// [`Transition`] before running any side effect that observes the
    /// new state.
    pub fn transition(&self, next: ConnectionState) -> Result<Transition> {
        let mut state = self.state.lock().unwrap();
        let old = *state;
        if !old.allows(next) {
            return Err(WireError::State(format!(
                "invalid transition {old} -> {next}"
            )));
        }
        *state = next;
        tracing::debug!(%old, new = %next, "connection state changed");
        Ok(Transition {
            old,
            new: next,
            timestamp: now_millis(),
        })
    }

    /// Whether `current -> next` would be accepted.
    pub fn can_transition(&self, next: ConnectionState) -> bool {
        self.state.lock().unwrap().allows(next)
    }

    /// Read-only snapshot of the session counters.
    pub fn session(&self) -> Session {
        self.session.lock().unwrap().clone()
    }

    /// Mutate the session counters under the machine's lock.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        f(&mut self.session.lock().unwrap())
    }

    /// Start a fresh session (used when opening from full disconnect).
    /// Reconnects within a lifetime keep their counters.
    pub fn reset_session(&self) {
        *self.session.lock().unwrap() = Session::new();
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
