//! Process-level pressure signals.
//!
//! A [`SystemSampler`] combines a [`ResourceProbe`] (CPU and memory
//! utilization, usually shared by every shedder in the process) with request
//! accounting fed by the shedding middleware: in-flight count, request rate
//! and average response time since the previous sample.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::time::Instant;

/// One reading of every pressure signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SystemSignals {
    /// CPU utilization in `[0, 1]`.
    pub cpu: f64,
    /// Memory utilization in `[0, 1]`.
    pub memory: f64,
    /// Requests currently in flight.
    pub concurrency: usize,
    /// Completed requests per second since the previous sample.
    pub request_rate: f64,
    /// Mean response time of requests completed since the previous sample.
    #[serde(rename = "response_time_ms", serialize_with = "as_millis")]
    pub response_time: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// Source of CPU and memory utilization.
pub trait ResourceProbe: Send + Sync {
    fn cpu_utilization(&self) -> f64;
    fn memory_utilization(&self) -> f64;
    fn name(&self) -> &'static str {
        "unnamed"
    }
}

/// Host utilization via `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceProbe for SysinfoProbe {
    fn cpu_utilization(&self) -> f64 {
        let mut sys = self.system.lock();
        sys.refresh_cpu_all();
        (sys.global_cpu_usage() as f64 / 100.0).clamp(0.0, 1.0)
    }

    fn memory_utilization(&self) -> f64 {
        let mut sys = self.system.lock();
        sys.refresh_memory();
        let total = sys.total_memory();
        if total == 0 {
            return 0.0;
        }
        (sys.used_memory() as f64 / total as f64).clamp(0.0, 1.0)
    }

    fn name(&self) -> &'static str {
        "sysinfo"
    }
}

/// Probe whose readings are set by hand; used by tests and by embedders that
/// already collect utilization elsewhere.
#[derive(Debug, Default)]
pub struct ManualProbe {
    cpu: AtomicU64,
    memory: AtomicU64,
}

impl ManualProbe {
    pub fn new(cpu: f64, memory: f64) -> Self {
        let p = Self::default();
        p.set_cpu(cpu);
        p.set_memory(memory);
        p
    }

    pub fn set_cpu(&self, v: f64) {
        self.cpu.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn set_memory(&self, v: f64) {
        self.memory.store(v.to_bits(), Ordering::Relaxed);
    }
}

impl ResourceProbe for ManualProbe {
    fn cpu_utilization(&self) -> f64 {
        f64::from_bits(self.cpu.load(Ordering::Relaxed))
    }

    fn memory_utilization(&self) -> f64 {
        f64::from_bits(self.memory.load(Ordering::Relaxed))
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

#[derive(Debug)]
struct Window {
    started: Instant,
    completed: u64,
    latency_total: Duration,
}

impl Window {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            completed: 0,
            latency_total: Duration::ZERO,
        }
    }
}

/// Samples pressure signals for one shedder.
pub struct SystemSampler {
    probe: Arc<dyn ResourceProbe>,
    inflight: Arc<AtomicUsize>,
    window: Mutex<Window>,
    last: Mutex<SystemSignals>,
}

impl SystemSampler {
    pub fn new(probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            probe,
            inflight: Arc::new(AtomicUsize::new(0)),
            window: Mutex::new(Window::new()),
            last: Mutex::new(SystemSignals::default()),
        }
    }

    /// Count a request as in flight until the returned guard is dropped.
    pub fn begin_request(&self) -> InflightGuard {
        self.inflight.fetch_add(1, Ordering::Relaxed);
        InflightGuard {
            inflight: Arc::clone(&self.inflight),
        }
    }

    /// Record a completed request and its latency.
    pub fn record_response(&self, latency: Duration) {
        let mut w = self.window.lock();
        w.completed += 1;
        w.latency_total += latency;
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Relaxed)
    }

    /// Take a new reading and start a new accounting window.
    pub fn sample(&self) -> SystemSignals {
        let (request_rate, response_time) = {
            let mut w = self.window.lock();
            let elapsed = w.started.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 {
                w.completed as f64 / elapsed
            } else {
                0.0
            };
            let mean = if w.completed > 0 {
                let nanos = w.latency_total.as_nanos() / u128::from(w.completed);
                Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
            } else {
                Duration::ZERO
            };
            *w = Window::new();
            (rate, mean)
        };

        let signals = SystemSignals {
            cpu: self.probe.cpu_utilization(),
            memory: self.probe.memory_utilization(),
            concurrency: self.inflight(),
            request_rate,
            response_time,
        };
        *self.last.lock() = signals;
        signals
    }

    /// Most recent reading without sampling again.
    pub fn last(&self) -> SystemSignals {
        *self.last.lock()
    }

    pub fn probe_name(&self) -> &'static str {
        self.probe.name()
    }
}

/// Decrements the in-flight count on drop.
pub struct InflightGuard {
    inflight: Arc<AtomicUsize>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_sample_reports_window_and_resets() {
        let probe = Arc::new(ManualProbe::new(0.5, 0.25));
        let sampler = SystemSampler::new(probe);

        let guard = sampler.begin_request();
        sampler.record_response(Duration::from_millis(100));
        sampler.record_response(Duration::from_millis(300));
        tokio::time::advance(Duration::from_secs(2)).await;

        let s = sampler.sample();
        assert_eq!(s.cpu, 0.5);
        assert_eq!(s.memory, 0.25);
        assert_eq!(s.concurrency, 1);
        assert!((s.request_rate - 1.0).abs() < 1e-6);
        assert_eq!(s.response_time, Duration::from_millis(200));
        assert_eq!(sampler.last(), s);

        drop(guard);
        tokio::time::advance(Duration::from_secs(1)).await;
        let s = sampler.sample();
        assert_eq!(s.concurrency, 0);
        assert_eq!(s.request_rate, 0.0);
        assert_eq!(s.response_time, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mean_latency_with_large_window() {
        let sampler = SystemSampler::new(Arc::new(ManualProbe::default()));
        {
            let mut w = sampler.window.lock();
            w.completed = 1 << 32;
            w.latency_total = Duration::from_secs(1 << 32);
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(sampler.sample().response_time, Duration::from_secs(1));
    }
}
