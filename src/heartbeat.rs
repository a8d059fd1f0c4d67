//! Heartbeat: periodic liveness probe and round-trip measurement.
//!
//! While a session is open the controller dispatches the configured
//! probe payload every `interval` through the injected send hook and
//! arms a pong timer of `timeout`. A pong (inbound message whose `type`
//! equals the configured `pong_type`) clears the timer and records the
//! round-trip in a bounded sample ring. Timer expiry invokes the timeout
//! callback; the facade maps that to `disconnect(4001)` and, when
//! configured, a reconnect.
//!
//! At most one probe is in flight: a tick that lands while a pong is
//! still outstanding is skipped rather than stacked.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::config::HeartbeatConfig;
use crate::error::Result;
use crate::BoxFuture;

/// Bound on the retained round-trip sample ring.
pub const MAX_LATENCY_SAMPLES: usize = 100;

/// Hook used to dispatch a probe via the normal send path.
pub type ProbeFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<()>> + Send + Sync>;
/// Invoked with each completed round-trip, in milliseconds.
pub type LatencyFn = Arc<dyn Fn(f64) + Send + Sync>;
/// Invoked when a probe's pong never arrives.
pub type TimeoutFn = Arc<dyn Fn() + Send + Sync>;

struct HbInner {
    ticker: Option<JoinHandle<()>>,
    pong_timer: Option<JoinHandle<()>>,
    /// Send timestamp of the probe currently awaiting its pong.
    sent_at: Option<Instant>,
    samples: VecDeque<f64>,
    on_latency: Option<LatencyFn>,
}

/// Periodic liveness prober.
pub struct HeartbeatController {
    config: Mutex<HeartbeatConfig>,
    inner: Arc<Mutex<HbInner>>,
}

impl HeartbeatController {
    /// Create a stopped controller.
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config: Mutex::new(config),
            inner: Arc::new(Mutex::new(HbInner {
                ticker: None,
                pong_timer: None,
                sent_at: None,
                samples: VecDeque::with_capacity(MAX_LATENCY_SAMPLES),
                on_latency: None,
            })),
        }
    }

    /// Start probing. A running controller is restarted.
    ///
    /// No-op when heartbeats are disabled in the config.
    pub fn start(&self, probe: ProbeFn, on_latency: LatencyFn, on_timeout: TimeoutFn) {
        self.stop();
        let config = self.config.lock().unwrap().clone();
        if !config.enabled {
            return;
        }

        let inner = self.inner.clone();
        inner.lock().unwrap().on_latency = Some(on_latency);

        let ticker_inner = inner.clone();
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(config.interval).await;

                {
                    let mut hb = ticker_inner.lock().unwrap();
                    if hb.sent_at.is_some() {
                        // Previous probe still awaiting its pong.
                        continue;
                    }
                    hb.sent_at = Some(Instant::now());

                    if let Some(old) = hb.pong_timer.take() {
                        old.abort();
                    }
                    let timer_inner = ticker_inner.clone();
                    let timeout_cb = on_timeout.clone();
                    hb.pong_timer = Some(tokio::spawn(async move {
                        tokio::time::sleep(config.timeout).await;
                        let expired = {
                            let mut hb = timer_inner.lock().unwrap();
                            hb.sent_at.take().is_some()
                        };
                        if expired {
                            tracing::warn!("heartbeat pong missed");
                            timeout_cb();
                        }
                    }));
                }

                if let Err(err) = probe(config.message.clone()).await {
                    tracing::debug!(%err, "heartbeat probe dispatch failed");
                }
            }
        });
        inner.lock().unwrap().ticker = Some(ticker);
    }

    /// Record a pong for the outstanding probe, if any.
    ///
    /// Returns the round-trip sample in milliseconds.
    pub fn handle_pong(&self) -> Option<f64> {
        let (sample, on_latency) = {
            let mut hb = self.inner.lock().unwrap();
            let sent = hb.sent_at.take()?;
            if let Some(timer) = hb.pong_timer.take() {
                timer.abort();
            }
            let sample = sent.elapsed().as_secs_f64() * 1_000.0;
            if hb.samples.len() == MAX_LATENCY_SAMPLES {
                hb.samples.pop_front();
            }
            hb.samples.push_back(sample);
            (sample, hb.on_latency.clone())
        };
        if let Some(cb) = on_latency {
            cb(sample);
        }
        Some(sample)
    }

    /// Whether an inbound message is this controller's pong.
    pub fn is_pong(&self, message: &Value) -> bool {
        let config = self.config.lock().unwrap();
        message.get("type").and_then(Value::as_str) == Some(config.pong_type.as_str())
    }

    /// Stop probing and clear the in-flight probe.
    pub fn stop(&self) {
        let mut hb = self.inner.lock().unwrap();
        if let Some(ticker) = hb.ticker.take() {
            ticker.abort();
        }
        if let Some(timer) = hb.pong_timer.take() {
            timer.abort();
        }
        hb.sent_at = None;
        hb.on_latency = None;
    }

    /// Replace the configuration. The controller is stopped and stays
    /// stopped until the next [`start`](Self::start).
    pub fn update_config(&self, config: HeartbeatConfig) {
        self.stop();
        *self.config.lock().unwrap() = config;
    }

    /// Mean of the retained round-trip samples, milliseconds.
    pub fn avg_latency(&self) -> Option<f64> {
        let hb = self.inner.lock().unwrap();
        if hb.samples.is_empty() {
            return None;
        }
        Some(hb.samples.iter().sum::<f64>() / hb.samples.len() as f64)
    }

    /// Copy of the retained samples, oldest first.
    pub fn samples(&self) -> Vec<f64> {
        self.inner.lock().unwrap().samples.iter().copied().collect()
    }
}

impl Drop for HeartbeatController {
    fn drop(&mut self) {
        self.stop();
    }
}
