//! Performance monitor: throughput, latency percentiles, quality score.
//!
//! Send/receive timestamps live in windowed arrays (samples older than
//! the window are pruned), latency samples in a bounded array, error
//! messages in a bounded ring. The quality score starts at 100 and
//! deducts by thresholded bands for average latency, error rate,
//! reconnect count, and queue usage; the floor is 0.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

use crate::id::now_millis;

/// Monitor retention settings.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Width of the rate window.
    pub window: Duration,
    /// Retained latency samples.
    pub max_latency_samples: usize,
    /// Retained error messages.
    pub max_errors: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_latency_samples: 100,
            max_errors: 50,
        }
    }
}

/// Latency distribution over the retained samples, milliseconds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyStats {
    pub current: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub total_sent: u64,
    pub total_received: u64,
    pub total_errors: u64,
    /// Messages per second over the window.
    pub send_rate: f64,
    pub receive_rate: f64,
    pub latency: LatencyStats,
    /// Errors over total traffic; 0 when idle.
    pub error_rate: f64,
    pub reconnects: u32,
    /// Outbox occupancy in `[0, 1]`.
    pub queue_usage: f64,
    /// 0–100 aggregate health signal.
    pub quality_score: u32,
}

/// Rolling performance bookkeeping.
pub struct PerformanceMonitor {
    config: MonitorConfig,
    sent: VecDeque<u64>,
    received: VecDeque<u64>,
    latencies: VecDeque<f64>,
    errors: VecDeque<(u64, String)>,
    total_sent: u64,
    total_received: u64,
    total_errors: u64,
    reconnects: u32,
    queue_usage: f64,
}

impl PerformanceMonitor {
    /// Fresh monitor with zeroed counters.
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            sent: VecDeque::new(),
            received: VecDeque::new(),
            latencies: VecDeque::new(),
            errors: VecDeque::new(),
            total_sent: 0,
            total_received: 0,
            total_errors: 0,
            reconnects: 0,
            queue_usage: 0.0,
        }
    }

    /// Count one outbound message.
    pub fn record_send(&mut self) {
        self.total_sent += 1;
        self.sent.push_back(now_millis());
        self.prune();
    }

    /// Count one inbound message.
    pub fn record_receive(&mut self) {
        self.total_received += 1;
        self.received.push_back(now_millis());
        self.prune();
    }

    /// Record a round-trip latency sample, milliseconds.
    pub fn record_latency(&mut self, sample_ms: f64) {
        if self.latencies.len() == self.config.max_latency_samples {
            self.latencies.pop_front();
        }
        self.latencies.push_back(sample_ms);
    }

    /// Record an error message.
    pub fn record_error(&mut self, message: impl Into<String>) {
        self.total_errors += 1;
        if self.errors.len() == self.config.max_errors {
            self.errors.pop_front();
        }
        self.errors.push_back((now_millis(), message.into()));
    }

    /// Count one completed reconnect.
    pub fn record_reconnect(&mut self) {
        self.reconnects += 1;
    }

    /// Mirror outbox occupancy.
    pub fn set_queue_usage(&mut self, used: usize, capacity: usize) {
        self.queue_usage = if capacity == 0 {
            0.0
        } else {
            (used as f64 / capacity as f64).clamp(0.0, 1.0)
        };
    }

    fn prune(&mut self) {
        let cutoff = now_millis().saturating_sub(self.config.window.as_millis() as u64);
        while self.sent.front().is_some_and(|&at| at < cutoff) {
            self.sent.pop_front();
        }
        while self.received.front().is_some_and(|&at| at < cutoff) {
            self.received.pop_front();
        }
    }

    /// Point-in-time snapshot.
    pub fn metrics(&mut self) -> Metrics {
        self.prune();
        let window_secs = self.config.window.as_secs_f64().max(f64::EPSILON);
        let traffic = self.total_sent + self.total_received;
        let error_rate = if traffic == 0 {
            0.0
        } else {
            self.total_errors as f64 / traffic as f64
        };
        let latency = self.latency_stats();
        let quality_score = self.quality_score(&latency, error_rate);

        Metrics {
            total_sent: self.total_sent,
            total_received: self.total_received,
            total_errors: self.total_errors,
            send_rate: self.sent.len() as f64 / window_secs,
            receive_rate: self.received.len() as f64 / window_secs,
            latency,
            error_rate,
            reconnects: self.reconnects,
            queue_usage: self.queue_usage,
            quality_score,
        }
    }

    fn latency_stats(&self) -> LatencyStats {
        if self.latencies.is_empty() {
            return LatencyStats::default();
        }
        let mut sorted: Vec<f64> = self.latencies.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));

        LatencyStats {
            current: *self.latencies.back().unwrap_or(&0.0),
            avg: sorted.iter().sum::<f64>() / sorted.len() as f64,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            p95: percentile(&sorted, 95.0),
            p99: percentile(&sorted, 99.0),
        }
    }

    fn quality_score(&self, latency: &LatencyStats, error_rate: f64) -> u32 {
        let mut score: i32 = 100;

        score -= match latency.avg {
            avg if avg > 500.0 => 30,
            avg if avg > 200.0 => 15,
            avg if avg > 100.0 => 5,
            _ => 0,
        };
        score -= match error_rate {
            rate if rate > 0.10 => 30,
            rate if rate > 0.05 => 15,
            rate if rate > 0.01 => 5,
            _ => 0,
        };
        score -= match self.reconnects {
            n if n > 5 => 20,
            n if n > 2 => 10,
            n if n > 0 => 5,
            _ => 0,
        };
        score -= match self.queue_usage {
            usage if usage > 0.9 => 15,
            usage if usage > 0.5 => 5,
            _ => 0,
        };

        score.max(0) as u32
    }

    /// Recent error messages, oldest first.
    pub fn recent_errors(&self) -> Vec<String> {
        self.errors.iter().map(|(_, msg)| msg.clone()).collect()
    }

    /// Render a human-readable multi-line summary.
    pub fn generate_report(&mut self) -> String {
        let m = self.metrics();
        format!(
            "connection quality report\n\
             ─────────────────────────\n\
             quality score : {:>3}/100\n\
             sent          : {} total, {:.2}/s\n\
             received      : {} total, {:.2}/s\n\
             latency (ms)  : cur {:.1} / avg {:.1} / min {:.1} / max {:.1} / p95 {:.1} / p99 {:.1}\n\
             errors        : {} total ({:.2}% of traffic)\n\
             reconnects    : {}\n\
             queue usage   : {:.0}%",
            m.quality_score,
            m.total_sent,
            m.send_rate,
            m.total_received,
            m.receive_rate,
            m.latency.current,
            m.latency.avg,
            m.latency.min,
            m.latency.max,
            m.latency.p95,
            m.latency.p99,
            m.total_errors,
            m.error_rate * 100.0,
            m.reconnects,
            m.queue_usage * 100.0,
        )
    }

    /// Zero every counter and buffer.
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

/// Nearest-rank percentile over an ascending slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_and_rates() {
        let mut mon = PerformanceMonitor::default();
        for _ in 0..10 {
            mon.record_send();
        }
        for _ in 0..4 {
            mon.record_receive();
        }

        let m = mon.metrics();
        assert_eq!(m.total_sent, 10);
        assert_eq!(m.total_received, 4);
        assert!(m.send_rate > 0.0);
        assert!(m.send_rate > m.receive_rate);
    }

    #[test]
    fn test_latency_distribution() {
        let mut mon = PerformanceMonitor::default();
        for sample in [10.0, 20.0, 30.0, 40.0, 50.0] {
            mon.record_latency(sample);
        }

        let m = mon.metrics();
        assert_eq!(m.latency.current, 50.0);
        assert_eq!(m.latency.min, 10.0);
        assert_eq!(m.latency.max, 50.0);
        assert_eq!(m.latency.avg, 30.0);
        assert_eq!(m.latency.p95, 50.0);
    }

    #[test]
    fn test_latency_samples_bounded() {
        let mut mon = PerformanceMonitor::new(MonitorConfig {
            max_latency_samples: 10,
            ..Default::default()
        });
        for i in 0..100 {
            mon.record_latency(i as f64);
        }
        assert_eq!(mon.latencies.len(), 10);
        // Oldest samples dropped.
        assert_eq!(mon.metrics().latency.min, 90.0);
    }

    #[test]
    fn test_error_rate() {
        let mut mon = PerformanceMonitor::default();
        assert_eq!(mon.metrics().error_rate, 0.0);

        for _ in 0..8 {
            mon.record_send();
        }
        for _ in 0..2 {
            mon.record_receive();
        }
        mon.record_error("boom");

        let m = mon.metrics();
        assert!((m.error_rate - 0.1).abs() < 1e-9);
        assert_eq!(mon.recent_errors(), vec!["boom".to_string()]);
    }

    #[test]
    fn test_error_ring_bounded() {
        let mut mon = PerformanceMonitor::new(MonitorConfig {
            max_errors: 3,
            ..Default::default()
        });
        for i in 0..10 {
            mon.record_error(format!("err-{i}"));
        }
        assert_eq!(mon.recent_errors().len(), 3);
        assert_eq!(mon.metrics().total_errors, 10);
    }

    #[test]
    fn test_quality_score_perfect_when_idle() {
        let mut mon = PerformanceMonitor::default();
        assert_eq!(mon.metrics().quality_score, 100);
    }

    #[test]
    fn test_quality_score_deductions() {
        let mut mon = PerformanceMonitor::default();
        mon.record_latency(600.0); // avg > 500 → -30
        mon.record_send();
        mon.record_error("x"); // rate 1.0 → -30
        for _ in 0..6 {
            mon.record_reconnect(); // > 5 → -20
        }
        mon.set_queue_usage(95, 100); // > 0.9 → -15

        assert_eq!(mon.metrics().quality_score, 100 - 30 - 30 - 20 - 15);
    }

    #[test]
    fn test_quality_score_floor_zero() {
        let mut mon = PerformanceMonitor::default();
        mon.record_latency(1_000.0);
        mon.record_send();
        mon.record_error("a");
        mon.record_error("b");
        for _ in 0..10 {
            mon.record_reconnect();
        }
        mon.set_queue_usage(100, 100);
        // -30 -30 -20 -15 = 5, plus nothing pushes below zero.
        assert!(mon.metrics().quality_score <= 5);
    }

    #[test]
    fn test_report_renders() {
        let mut mon = PerformanceMonitor::default();
        mon.record_send();
        mon.record_latency(12.5);
        let report = mon.generate_report();
        assert!(report.contains("quality score"));
        assert!(report.contains("latency"));
        assert!(report.lines().count() >= 7);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let sorted: Vec<f64> = (1..=100).map(|i| i as f64).collect();
        assert_eq!(percentile(&sorted, 95.0), 95.0);
        assert_eq!(percentile(&sorted, 99.0), 99.0);
        assert_eq!(percentile(&sorted, 100.0), 100.0);
        assert_eq!(percentile(&[], 95.0), 0.0);
    }

    #[test]
    fn test_reset() {
        let mut mon = PerformanceMonitor::default();
        mon.record_send();
        mon.record_error("x");
        mon.reset();
        let m = mon.metrics();
        assert_eq!(m.total_sent, 0);
        assert_eq!(m.total_errors, 0);
        assert_eq!(m.quality_score, 100);
    }
}
