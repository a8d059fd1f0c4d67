//! Reconnect scheduling: exponential backoff with jitter.
//!
//! Delay for zero-indexed attempt `n` is `min(max_delay, delay *
//! factor^n)` plus uniform jitter drawn from `[-j, +j]` with
//! `j = capped_delay * jitter`, clamped to non-negative. The controller
//! owns a single retry timer; arming a new one always aborts the old.
//! It drives retries through the facade's connect path so every
//! subsystem re-initializes on success.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;

use crate::config::ReconnectConfig;

/// Backoff scheduler for connection retries.
pub struct ReconnectController {
    config: ReconnectConfig,
    /// Failures since the last successful connect.
    attempt: AtomicU32,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectController {
    /// Create a controller with the given backoff parameters.
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt: AtomicU32::new(0),
            timer: Mutex::new(None),
        }
    }

    /// Whether automatic reconnection is configured at all.
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Attempts failed since the last success.
    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::Acquire)
    }

    /// Configured attempt bound; 0 means unbounded.
    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Whether the attempt budget is spent.
    pub fn exhausted(&self) -> bool {
        self.config.max_attempts > 0 && self.attempt() >= self.config.max_attempts
    }

    /// Backoff delay for zero-indexed attempt `n`.
    pub fn delay_for(&self, n: u32) -> Duration {
        let base = self.config.delay.as_millis() as f64;
        let max = self.config.max_delay.as_millis() as f64;
        let capped = (base * self.config.factor.powi(n as i32)).min(max);

        let j = capped * self.config.jitter;
        let offset = if j > 0.0 {
            rand::thread_rng().gen_range(-j..=j)
        } else {
            0.0
        };
        Duration::from_millis((capped + offset).max(0.0) as u64)
    }

    /// Delay the next scheduled attempt would use.
    pub fn next_delay(&self) -> Duration {
        self.delay_for(self.attempt())
    }

    /// Record a failed attempt; returns the new failure count.
    pub fn record_failure(&self) -> u32 {
        self.attempt.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record a successful connect; the attempt counter starts over.
    pub fn record_success(&self) {
        self.attempt.store(0, Ordering::Release);
    }

    /// Arm the retry timer: after `delay`, run `retry`.
    ///
    /// Any previously armed timer is aborted first; the controller never
    /// holds two timers.
    pub fn schedule<F>(&self, delay: Duration, retry: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut timer = self.timer.lock().unwrap();
        if let Some(old) = timer.take() {
            old.abort();
        }
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            retry.await;
        }));
    }

    /// Abort any pending retry timer. The attempt counter is kept;
    /// only [`reset`](Self::reset) clears it.
    pub fn cancel(&self) {
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.abort();
        }
    }

    /// Cancel the timer and clear the attempt counter.
    pub fn reset(&self) {
        self.cancel();
        self.attempt.store(0, Ordering::Release);
    }
}

impl Drop for ReconnectController {
    fn drop(&mut self) {
        self.cancel();
    }
}
