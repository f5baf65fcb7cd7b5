//! In-process metrics: counters, timers and gauges.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const MAX_TIMER_SAMPLES: usize = 1000;

/// Builds the storage key for a metric: `name{k=v,...}` with sorted labels.
#[must_use]
pub fn metric_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort_unstable();
    let rendered: Vec<String> = sorted.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{name}{{{}}}", rendered.join(","))
}

/// Summary statistics of a timer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerSummary {
    /// Number of samples retained.
    pub count: usize,
    /// Mean duration in milliseconds.
    pub avg: f64,
    /// Fastest sample.
    pub min: f64,
    /// Slowest sample.
    pub max: f64,
    /// 95th percentile.
    pub p95: f64,
    /// 99th percentile.
    pub p99: f64,
}

impl TimerSummary {
    fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);
        let count = sorted.len();
        let percentile = |p: f64| {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
            let index = ((count - 1) as f64 * p).round() as usize;
            sorted[index.min(count - 1)]
        };
        #[allow(clippy::cast_precision_loss)]
        let avg = sorted.iter().sum::<f64>() / count as f64;
        Some(Self {
            count,
            avg,
            min: sorted[0],
            max: sorted[count - 1],
            p95: percentile(0.95),
            p99: percentile(0.99),
        })
    }
}

/// Point-in-time copy of every metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Counter values by key.
    pub counters: BTreeMap<String, u64>,
    /// Timer summaries by key.
    pub timers: BTreeMap<String, TimerSummary>,
    /// Gauge values by key.
    pub gauges: BTreeMap<String, f64>,
}

/// Thread-safe metrics store.
#[derive(Debug, Default)]
pub struct MetricsStore {
    counters: RwLock<HashMap<String, u64>>,
    timers: RwLock<HashMap<String, Vec<f64>>>,
    gauges: RwLock<HashMap<String, f64>>,
}

impl MetricsStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `value` to a counter.
    pub fn increment(&self, name: &str, labels: &[(&str, &str)], value: u64) {
        let key = metric_key(name, labels);
        let mut counters = self.counters.write();
        let entry = counters.entry(key).or_insert(0);
        *entry = entry.saturating_add(value);
    }

    /// Records a timer sample in milliseconds. Only the most recent samples
    /// are retained.
    pub fn record_timer(&self, name: &str, labels: &[(&str, &str)], duration_ms: f64) {
        let key = metric_key(name, labels);
        let mut timers = self.timers.write();
        let samples = timers.entry(key).or_default();
        samples.push(duration_ms);
        if samples.len() > MAX_TIMER_SAMPLES {
            let excess = samples.len() - MAX_TIMER_SAMPLES;
            samples.drain(..excess);
        }
    }

    /// Sets a gauge.
    pub fn set_gauge(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        self.gauges.write().insert(metric_key(name, labels), value);
    }

    /// Returns a counter value, zero when never incremented.
    #[must_use]
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read()
            .get(&metric_key(name, labels))
            .copied()
            .unwrap_or(0)
    }

    /// Returns a gauge value.
    #[must_use]
    pub fn gauge(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        self.gauges.read().get(&metric_key(name, labels)).copied()
    }

    /// Returns a timer summary.
    #[must_use]
    pub fn timer_summary(&self, name: &str, labels: &[(&str, &str)]) -> Option<TimerSummary> {
        self.timers
            .read()
            .get(&metric_key(name, labels))
            .and_then(|samples| TimerSummary::from_samples(samples))
    }

    /// Copies every metric.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.read().iter().map(|(k, v)| (k.clone(), *v)).collect(),
            timers: self
                .timers
                .read()
                .iter()
                .filter_map(|(k, v)| TimerSummary::from_samples(v).map(|s| (k.clone(), s)))
                .collect(),
            gauges: self.gauges.read().iter().map(|(k, v)| (k.clone(), *v)).collect(),
        }
    }

    /// Removes every metric.
    pub fn clear(&self) {
        self.counters.write().clear();
        self.timers.write().clear();
        self.gauges.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_key_sorts_labels() {
        assert_eq!(metric_key("calls", &[]), "calls");
        assert_eq!(
            metric_key("calls", &[("stage", "fetch"), ("outcome", "ok")]),
            "calls{outcome=ok,stage=fetch}"
        );
    }

    #[test]
    fn test_counters_accumulate() {
        let store = MetricsStore::new();
        store.increment("stage.completed", &[("stage", "a")], 1);
        store.increment("stage.completed", &[("stage", "a")], 2);
        store.increment("stage.completed", &[("stage", "b")], 1);

        assert_eq!(store.counter("stage.completed", &[("stage", "a")]), 3);
        assert_eq!(store.counter("stage.completed", &[("stage", "b")]), 1);
        assert_eq!(store.counter("stage.completed", &[]), 0);
    }

    #[test]
    fn test_timer_summary_percentiles() {
        let store = MetricsStore::new();
        for ms in 1..=100 {
            store.record_timer("latency", &[], f64::from(ms));
        }

        let summary = store.timer_summary("latency", &[]).unwrap();
        assert_eq!(summary.count, 100);
        assert!((summary.avg - 50.5).abs() < f64::EPSILON);
        assert!((summary.min - 1.0).abs() < f64::EPSILON);
        assert!((summary.max - 100.0).abs() < f64::EPSILON);
        assert!((summary.p95 - 95.0).abs() < f64::EPSILON);
        assert!((summary.p99 - 99.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_timer_retains_recent_samples() {
        let store = MetricsStore::new();
        for ms in 0..(MAX_TIMER_SAMPLES + 10) {
            #[allow(clippy::cast_precision_loss)]
            store.record_timer("t", &[], ms as f64);
        }
        let summary = store.timer_summary("t", &[]).unwrap();
        assert_eq!(summary.count, MAX_TIMER_SAMPLES);
        assert!((summary.min - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_snapshot_and_clear() {
        let store = MetricsStore::new();
        store.set_gauge("circuit_breaker.state", &[("name", "reasoning")], 1.0);
        store.increment("runs", &[], 1);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.gauges["circuit_breaker.state{name=reasoning}"], 1.0);
        assert_eq!(snapshot.counters["runs"], 1);

        store.clear();
        assert_eq!(store.snapshot(), MetricsSnapshot::default());
    }
}
