//! Prometheus text exposition for recorder snapshots.
//!
//! Each recorder metric `m` of component `c` is exported as `c_m{name="<instance>"}`,
//! e.g. `circuit_breaker_rejected_total{name="payments"} 12`.

use super::{HistogramSnapshot, StatsSnapshot};
use std::collections::BTreeMap;
use std::fmt::Write;

enum Sample<'a> {
    Counter(u64),
    Gauge(f64),
    Histogram(&'a HistogramSnapshot),
}

impl Sample<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Sample::Counter(_) => "counter",
            Sample::Gauge(_) => "gauge",
            Sample::Histogram(_) => "histogram",
        }
    }
}

/// Accumulates samples from many instances, grouped by metric family.
#[derive(Default)]
pub struct PrometheusWriter<'a> {
    families: BTreeMap<String, Vec<(&'a str, Sample<'a>)>>,
}

impl<'a> PrometheusWriter<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, snap: &'a StatsSnapshot) -> &mut Self {
        let prefix = &snap.component;
        let instance = snap.instance.as_str();
        for (name, v) in &snap.counters {
            self.push(prefix, name, instance, Sample::Counter(*v));
        }
        for (name, v) in &snap.gauges {
            self.push(prefix, name, instance, Sample::Gauge(*v));
        }
        for (name, h) in &snap.histograms {
            self.push(prefix, name, instance, Sample::Histogram(h));
        }
        self
    }

    fn push(&mut self, prefix: &str, name: &str, instance: &'a str, sample: Sample<'a>) {
        self.families
            .entry(format!("{}_{}", prefix, name))
            .or_default()
            .push((instance, sample));
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(4096);
        for (family, samples) in &self.families {
            let Some((_, first)) = samples.first() else {
                continue;
            };
            let _ = writeln!(out, "# TYPE {} {}", family, first.kind());
            for (instance, sample) in samples {
                let label = escape_label(instance);
                match sample {
                    Sample::Counter(v) => {
                        let _ = writeln!(out, "{}{{name=\"{}\"}} {}", family, label, v);
                    }
                    Sample::Gauge(v) => {
                        let _ = writeln!(out, "{}{{name=\"{}\"}} {}", family, label, v);
                    }
                    Sample::Histogram(h) => {
                        for (le, n) in &h.buckets {
                            let _ = writeln!(
                                out,
                                "{}_bucket{{name=\"{}\",le=\"{}\"}} {}",
                                family, label, le, n
                            );
                        }
                        let _ = writeln!(
                            out,
                            "{}_bucket{{name=\"{}\",le=\"+Inf\"}} {}",
                            family, label, h.count
                        );
                        let _ = writeln!(out, "{}_sum{{name=\"{}\"}} {}", family, label, h.sum);
                        let _ = writeln!(out, "{}_count{{name=\"{}\"}} {}", family, label, h.count);
                    }
                }
            }
        }
        out
    }
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

/// Render a set of snapshots in Prometheus text format.
pub fn render_prometheus(snapshots: &[StatsSnapshot]) -> String {
    let mut writer = PrometheusWriter::new();
    for snap in snapshots {
        writer.add(snap);
    }
    writer.render()
}
