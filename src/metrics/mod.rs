//! Per-component statistics bundles.
//!
//! Every guard owns a [`StatsRecorder`] holding monotonic counters,
//! instantaneous gauges and fixed-bucket histograms. Metric names are
//! prefixed with the component (`load_shedder`, `circuit_breaker`,
//! `connection_tracker`) and labelled with the instance name when exported,
//! see [`export`].

pub mod export;

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use export::{render_prometheus, PrometheusWriter};

/// Default histogram buckets, in seconds.
pub const LATENCY_BUCKETS: [f64; 11] = [
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// f64 gauge stored as raw bits.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }
    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

#[derive(Debug)]
pub struct Histogram {
    bounds: Vec<f64>,
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum: Gauge,
}

impl Histogram {
    pub fn new(bounds: &[f64]) -> Self {
        Self {
            bounds: bounds.to_vec(),
            buckets: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            count: AtomicU64::new(0),
            sum: Gauge::default(),
        }
    }

    pub fn observe(&self, v: f64) {
        if let Some(i) = self.bounds.iter().position(|b| v <= *b) {
            self.buckets[i].fetch_add(1, Ordering::Relaxed);
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        // Lost updates on the sum under contention are tolerable for telemetry.
        self.sum.set(self.sum.get() + v);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut cumulative = 0;
        let buckets = self
            .bounds
            .iter()
            .zip(&self.buckets)
            .map(|(le, n)| {
                cumulative += n.load(Ordering::Relaxed);
                (*le, cumulative)
            })
            .collect();
        HistogramSnapshot {
            buckets,
            count: self.count.load(Ordering::Relaxed),
            sum: self.sum.get(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    /// Cumulative `(upper bound, count)` pairs.
    pub buckets: Vec<(f64, u64)>,
    pub count: u64,
    pub sum: f64,
}

impl HistogramSnapshot {
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Point-in-time copy of a recorder.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub component: String,
    pub instance: String,
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
    pub histograms: BTreeMap<String, HistogramSnapshot>,
}

impl StatsSnapshot {
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> f64 {
        self.gauges.get(name).copied().unwrap_or(0.0)
    }
}

/// Counter/gauge/histogram bundle for one guard instance.
///
/// Metrics are created on first use; handles are cached so the hot path is a
/// read lock plus an atomic add.
#[derive(Debug)]
pub struct StatsRecorder {
    component: String,
    instance: String,
    counters: RwLock<BTreeMap<&'static str, Arc<Counter>>>,
    gauges: RwLock<BTreeMap<&'static str, Arc<Gauge>>>,
    histograms: RwLock<BTreeMap<&'static str, Arc<Histogram>>>,
}

impl StatsRecorder {
    pub fn new(component: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            instance: instance.into(),
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
            histograms: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn counter(&self, name: &'static str) -> Arc<Counter> {
        if let Some(c) = self.counters.read().get(name) {
            return Arc::clone(c);
        }
        Arc::clone(self.counters.write().entry(name).or_default())
    }

    pub fn gauge(&self, name: &'static str) -> Arc<Gauge> {
        if let Some(g) = self.gauges.read().get(name) {
            return Arc::clone(g);
        }
        Arc::clone(self.gauges.write().entry(name).or_default())
    }

    pub fn histogram(&self, name: &'static str) -> Arc<Histogram> {
        if let Some(h) = self.histograms.read().get(name) {
            return Arc::clone(h);
        }
        Arc::clone(
            self.histograms
                .write()
                .entry(name)
                .or_insert_with(|| Arc::new(Histogram::new(&LATENCY_BUCKETS))),
        )
    }

    pub fn incr(&self, name: &'static str) {
        self.counter(name).inc();
    }

    pub fn set_gauge(&self, name: &'static str, v: f64) {
        self.gauge(name).set(v);
    }

    pub fn observe(&self, name: &'static str, v: f64) {
        self.histogram(name).observe(v);
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters.read().get(name).map(|c| c.get()).unwrap_or(0)
    }

    pub fn gauge_value(&self, name: &str) -> f64 {
        self.gauges.read().get(name).map(|g| g.get()).unwrap_or(0.0)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            component: self.component.clone(),
            instance: self.instance.clone(),
            counters: self
                .counters
                .read()
                .iter()
                .map(|(k, v)| (k.to_string(), v.get()))
                .collect(),
            gauges: self
                .gauges
                .read()
                .iter()
                .map(|(k, v)| (k.to_string(), v.get()))
                .collect(),
            histograms: self
                .histograms
                .read()
                .iter()
                .map(|(k, v)| (k.to_string(), v.snapshot()))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_gauges() {
        let rec = StatsRecorder::new("circuit_breaker", "db");
        rec.incr("requests_total");
        rec.incr("requests_total");
        rec.set_gauge("state", 2.0);

        assert_eq!(rec.counter_value("requests_total"), 2);
        assert_eq!(rec.counter_value("missing_total"), 0);
        assert_eq!(rec.gauge_value("state"), 2.0);

        let snap = rec.snapshot();
        assert_eq!(snap.instance, "db");
        assert_eq!(snap.counter("requests_total"), 2);
        assert_eq!(snap.gauge("state"), 2.0);
    }

    #[test]
    fn test_histogram_is_cumulative() {
        let h = Histogram::new(&[0.1, 1.0]);
        h.observe(0.05);
        h.observe(0.5);
        h.observe(5.0);

        let snap = h.snapshot();
        assert_eq!(snap.buckets, vec![(0.1, 1), (1.0, 2)]);
        assert_eq!(snap.count, 3);
        assert!((snap.mean() - 1.85).abs() < 1e-9);
    }
}
