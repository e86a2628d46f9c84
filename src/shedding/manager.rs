//! Named collection of load shedders.

use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use super::config::LoadShedderConfig;
use super::level::SheddingLevel;
use super::shedder::{LoadShedder, ShedderStats};
use crate::metrics::render_prometheus;
use crate::registry::Registry;
use crate::sampler::{ResourceProbe, SysinfoProbe, SystemSampler};
use crate::Result;

/// Process-wide totals across every registered shedder.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SheddingAggregate {
    pub instances: usize,
    pub forced_instances: usize,
    pub requests_total: u64,
    pub requests_shed_total: u64,
    /// Mean of the instances' current shed rates.
    pub average_shed_rate: f64,
    /// Shed requests over all requests.
    pub overall_shed_ratio: f64,
    pub highest_level: SheddingLevel,
    pub per_instance: Vec<ShedderStats>,
}

/// Owns named [`LoadShedder`]s sharing one resource probe.
///
/// Each shedder gets its own [`SystemSampler`] so request accounting stays
/// per instance while CPU and memory readings come from the shared probe.
pub struct LoadSheddingManager {
    probe: Arc<dyn ResourceProbe>,
    shedders: Registry<LoadShedder>,
}

impl LoadSheddingManager {
    pub fn new(probe: Arc<dyn ResourceProbe>) -> Self {
        Self {
            probe,
            shedders: Registry::new("shedding_manager"),
        }
    }

    /// Manager backed by host CPU/memory readings.
    pub fn with_system_probe() -> Self {
        Self::new(Arc::new(SysinfoProbe::new()))
    }

    /// Register a shedder and start its background tasks.
    pub fn create(&self, name: &str, config: LoadShedderConfig) -> Result<Arc<LoadShedder>> {
        let sampler = Arc::new(SystemSampler::new(Arc::clone(&self.probe)));
        let shedder = self
            .shedders
            .insert_with(name, || LoadShedder::new(name, config, sampler))?;
        shedder.start();
        info!(name, "load shedder registered");
        Ok(shedder)
    }

    /// Register a shedder without starting it; the caller drives
    /// [`LoadShedder::refresh`] or calls [`LoadShedder::start`] later.
    pub fn create_stopped(
        &self,
        name: &str,
        config: LoadShedderConfig,
    ) -> Result<Arc<LoadShedder>> {
        let sampler = Arc::new(SystemSampler::new(Arc::clone(&self.probe)));
        self.shedders
            .insert_with(name, || LoadShedder::new(name, config, sampler))
    }

    pub fn get(&self, name: &str) -> Option<Arc<LoadShedder>> {
        self.shedders.get(name)
    }

    /// Stop and unregister a shedder.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let shedder = self.shedders.remove(name)?;
        shedder.stop().await;
        info!(name, "load shedder removed");
        Ok(())
    }

    pub fn list(&self) -> Vec<String> {
        self.shedders.names()
    }

    pub fn len(&self) -> usize {
        self.shedders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shedders.is_empty()
    }

    pub fn force_level(&self, name: &str, level: SheddingLevel) -> Result<()> {
        self.shedders.require(name)?.force_level(level);
        Ok(())
    }

    pub fn release_override(&self, name: &str) -> Result<()> {
        self.shedders.require(name)?.release_override();
        Ok(())
    }

    pub fn reset(&self, name: &str) -> Result<()> {
        self.shedders.require(name)?.reset();
        Ok(())
    }

    pub fn reset_all(&self) {
        for shedder in self.shedders.values() {
            shedder.reset();
        }
    }

    /// Stop every shedder's background tasks. Instances stay registered.
    pub async fn stop_all(&self) {
        let shedders = self.shedders.values();
        futures::future::join_all(shedders.iter().map(|s| s.stop())).await;
    }

    /// Stop every shedder and empty the registry.
    pub async fn shutdown(&self) {
        let shedders = self.shedders.drain();
        futures::future::join_all(shedders.iter().map(|s| s.stop())).await;
    }

    pub fn stats(&self, name: &str) -> Result<ShedderStats> {
        Ok(self.shedders.require(name)?.stats())
    }

    pub fn aggregate(&self) -> SheddingAggregate {
        let per_instance: Vec<ShedderStats> =
            self.shedders.values().iter().map(|s| s.stats()).collect();
        if per_instance.is_empty() {
            return SheddingAggregate::default();
        }

        let requests_total: u64 = per_instance.iter().map(|s| s.requests_total).sum();
        let requests_shed_total: u64 = per_instance.iter().map(|s| s.requests_shed_total).sum();
        SheddingAggregate {
            instances: per_instance.len(),
            forced_instances: per_instance.iter().filter(|s| s.forced).count(),
            requests_total,
            requests_shed_total,
            average_shed_rate: per_instance.iter().map(|s| s.shed_rate).sum::<f64>()
                / per_instance.len() as f64,
            overall_shed_ratio: if requests_total == 0 {
                0.0
            } else {
                requests_shed_total as f64 / requests_total as f64
            },
            highest_level: per_instance
                .iter()
                .map(|s| s.level)
                .max()
                .unwrap_or_default(),
            per_instance,
        }
    }

    /// Prometheus text for every registered shedder.
    pub fn render_metrics(&self) -> String {
        let snapshots: Vec<_> = self
            .shedders
            .values()
            .iter()
            .map(|s| s.metrics_snapshot())
            .collect();
        render_prometheus(&snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::ManualProbe;
    use crate::shedding::shedder::RequestContext;

    fn manager() -> LoadSheddingManager {
        LoadSheddingManager::new(Arc::new(ManualProbe::new(0.1, 0.1)))
    }

    #[tokio::test]
    async fn test_create_list_remove() {
        let m = manager();
        m.create("api", LoadShedderConfig::default()).unwrap();
        m.create("admin", LoadShedderConfig::default()).unwrap();
        assert_eq!(m.list(), vec!["admin".to_string(), "api".to_string()]);

        let dup = m.create("api", LoadShedderConfig::default()).unwrap_err();
        assert!(dup.is_configuration());
        let api = format!("{:?}", m.get("api").unwrap());
        assert!(api.contains("name: \"api\"") && api.contains("level: None"));

        let api = m.get("api").unwrap();
        assert!(api.is_running());
        m.remove("api").await.unwrap();
        assert!(!api.is_running());
        assert!(m.get("api").is_none());
        assert!(m.remove("api").await.is_err());

        m.shutdown().await;
        assert!(m.is_empty());
    }

    #[tokio::test]
    async fn test_aggregate_totals() {
        let m = manager();
        let a = m.create_stopped("a", LoadShedderConfig::default()).unwrap();
        let b = m.create_stopped("b", LoadShedderConfig::default()).unwrap();
        m.force_level("a", SheddingLevel::Critical).unwrap();

        let ctx = RequestContext::new("GET", "/");
        a.should_shed(&ctx);
        a.should_shed(&ctx);
        b.should_shed(&ctx);
        b.should_shed(&ctx);

        let agg = m.aggregate();
        assert_eq!(agg.instances, 2);
        assert_eq!(agg.forced_instances, 1);
        assert_eq!(agg.requests_total, 4);
        assert_eq!(agg.requests_shed_total, 2);
        assert!((agg.overall_shed_ratio - 0.5).abs() < 1e-9);
        assert!((agg.average_shed_rate - 0.45).abs() < 1e-9);
        assert_eq!(agg.highest_level, SheddingLevel::Critical);

        m.reset_all();
        assert_eq!(m.aggregate().highest_level, SheddingLevel::None);
        assert!(m.force_level("missing", SheddingLevel::Light).is_err());
    }

    #[tokio::test]
    async fn test_metrics_rendering() {
        let m = manager();
        let s = m.create_stopped("api", LoadShedderConfig::default()).unwrap();
        s.force_level(SheddingLevel::Critical);
        s.should_shed(&RequestContext::default());

        let text = m.render_metrics();
        assert!(text.contains("load_shedder_requests_total{name=\"api\"} 1"));
        assert!(text.contains("load_shedder_requests_shed_total{name=\"api\"} 1"));
        assert!(text.contains("load_shedder_level{name=\"api\"} 4"));
    }
}
