//! Metrics registry with named counters and timers.
//!
//! Handles are cheap atomic clones; adapters look them up once at the start
//! of their loop and increment lock-free afterwards. The registry snapshot
//! feeds the CLI's Prometheus text endpoint.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A monotonically increasing counter.
#[derive(Debug, Clone, Default)]
pub struct Counter(Arc<AtomicU64>);

impl Counter {
    /// Increment by `n`.
    pub fn incr(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A timer accumulating observation sum and count.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    sum_ns: Arc<AtomicU64>,
    count: Arc<AtomicU64>,
}

impl Timer {
    /// Record one observation.
    pub fn record(&self, elapsed: Duration) {
        self.sum_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Total of all observations in nanoseconds.
    pub fn sum_ns(&self) -> u64 {
        self.sum_ns.load(Ordering::Relaxed)
    }

    /// Number of observations.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

/// Thread-safe registry handing out named counter and timer handles.
#[derive(Debug, Default)]
pub struct Metrics {
    counters: DashMap<String, Counter>,
    timers: DashMap<String, Timer>,
}

/// Shared handle to a metrics registry.
pub type SharedMetrics = Arc<Metrics>;

impl Metrics {
    /// Create an empty registry.
    pub fn new() -> SharedMetrics {
        Arc::new(Self::default())
    }

    /// Get or create a counter by name.
    pub fn counter(&self, name: &str) -> Counter {
        self.counters.entry(name.to_string()).or_default().clone()
    }

    /// Get or create a timer by name.
    pub fn timer(&self, name: &str) -> Timer {
        self.timers.entry(name.to_string()).or_default().clone()
    }

    /// Snapshot all metrics for export, sorted by name.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut counters: Vec<(String, u64)> = self
            .counters
            .iter()
            .map(|e| (e.key().clone(), e.value().get()))
            .collect();
        counters.sort();

        let mut timers: Vec<(String, u64, u64)> = self
            .timers
            .iter()
            .map(|e| (e.key().clone(), e.value().sum_ns(), e.value().count()))
            .collect();
        timers.sort();

        MetricsSnapshot { counters, timers }
    }
}

/// Point-in-time view of the registry.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Counter name and value pairs.
    pub counters: Vec<(String, u64)>,
    /// Timer name, sum in nanoseconds, and observation count triples.
    pub timers: Vec<(String, u64, u64)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_shares_state_by_name() {
        let metrics = Metrics::new();
        metrics.counter("input_received").incr(2);
        metrics.counter("input_received").incr(3);
        assert_eq!(metrics.counter("input_received").get(), 5);
    }

    #[test]
    fn test_timer_accumulates() {
        let metrics = Metrics::new();
        let timer = metrics.timer("input_latency_ns");
        timer.record(Duration::from_nanos(100));
        timer.record(Duration::from_nanos(50));
        assert_eq!(timer.count(), 2);
        assert_eq!(timer.sum_ns(), 150);
    }

    #[test]
    fn test_snapshot_sorted() {
        let metrics = Metrics::new();
        metrics.counter("b").incr(1);
        metrics.counter("a").incr(1);
        let snap = metrics.snapshot();
        assert_eq!(snap.counters[0].0, "a");
        assert_eq!(snap.counters[1].0, "b");
    }
}
