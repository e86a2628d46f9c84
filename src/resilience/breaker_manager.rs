//! Named collection of circuit breakers.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use super::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
use crate::metrics::render_prometheus;
use crate::registry::Registry;
use crate::Result;

#[derive(Debug, Clone, Default, Serialize)]
pub struct BreakerAggregate {
    pub instances: usize,
    pub closed: usize,
    pub open: usize,
    pub half_open: usize,
    pub requests: u64,
    pub failures: u64,
    pub rejections: u64,
    /// Failures over attempted calls across all breakers.
    pub overall_failure_rate: f64,
    pub per_instance: Vec<CircuitBreakerStats>,
}

/// Owns named [`CircuitBreaker`]s, one per downstream dependency.
pub struct CircuitBreakerManager {
    defaults: CircuitBreakerConfig,
    breakers: Registry<CircuitBreaker>,
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerManager {
    /// `defaults` is used by [`get_or_create`](Self::get_or_create).
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self {
            defaults,
            breakers: Registry::new("breaker_manager"),
        }
    }

    /// Manager pre-populated with one breaker per entry.
    pub fn from_configs(configs: &BTreeMap<String, CircuitBreakerConfig>) -> Result<Self> {
        let manager = Self::default();
        for (name, cfg) in configs {
            manager.create(name, cfg.clone())?;
        }
        Ok(manager)
    }

    pub fn create(&self, name: &str, config: CircuitBreakerConfig) -> Result<Arc<CircuitBreaker>> {
        let breaker = self
            .breakers
            .insert_with(name, || CircuitBreaker::new(name, config))?;
        info!(name, "circuit breaker registered");
        Ok(breaker)
    }

    pub fn get_or_create(&self, name: &str) -> Result<Arc<CircuitBreaker>> {
        self.breakers
            .get_or_insert_with(name, || CircuitBreaker::new(name, self.defaults.clone()))
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        self.breakers.remove(name)?;
        info!(name, "circuit breaker removed");
        Ok(())
    }

    pub fn list(&self) -> Vec<String> {
        self.breakers.names()
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn reset(&self, name: &str) -> Result<()> {
        self.breakers.require(name)?.reset();
        Ok(())
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.values() {
            breaker.reset();
        }
    }

    pub fn force_open(&self, name: &str) -> Result<()> {
        self.breakers.require(name)?.force_open();
        Ok(())
    }

    pub fn force_close(&self, name: &str) -> Result<()> {
        self.breakers.require(name)?.force_close();
        Ok(())
    }

    pub fn stats(&self, name: &str) -> Result<CircuitBreakerStats> {
        Ok(self.breakers.require(name)?.stats())
    }

    pub fn aggregate(&self) -> BreakerAggregate {
        let per_instance: Vec<CircuitBreakerStats> =
            self.breakers.values().iter().map(|b| b.stats()).collect();
        let count = |state: CircuitState| per_instance.iter().filter(|s| s.state == state).count();
        let successes: u64 = per_instance.iter().map(|s| s.successes).sum();
        let failures: u64 = per_instance.iter().map(|s| s.failures).sum();
        let attempted = successes + failures;

        BreakerAggregate {
            instances: per_instance.len(),
            closed: count(CircuitState::Closed),
            open: count(CircuitState::Open),
            half_open: count(CircuitState::HalfOpen),
            requests: per_instance.iter().map(|s| s.requests).sum(),
            failures,
            rejections: per_instance.iter().map(|s| s.rejections).sum(),
            overall_failure_rate: if attempted == 0 {
                0.0
            } else {
                failures as f64 / attempted as f64
            },
            per_instance,
        }
    }

    pub fn render_metrics(&self) -> String {
        let snapshots: Vec<_> = self
            .breakers
            .values()
            .iter()
            .map(|b| b.metrics_snapshot())
            .collect();
        render_prometheus(&snapshots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_uses_defaults() {
        let m =
            CircuitBreakerManager::new(CircuitBreakerConfig::new().with_failure_threshold(2));
        let a = m.get_or_create("search").unwrap();
        let again = m.get_or_create("search").unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(a.config().failure_threshold, 2);
        assert!(m.get_or_create("no spaces").is_err());
    }

    #[test]
    fn test_admin_operations() {
        let m = CircuitBreakerManager::default();
        m.create("db", CircuitBreakerConfig::default()).unwrap();
        m.create("cache", CircuitBreakerConfig::default()).unwrap();
        let dup = m.create("db", CircuitBreakerConfig::default()).unwrap_err();
        assert!(dup.is_configuration());
        let db = format!("{:?}", m.get("db").unwrap());
        assert!(db.contains("name: \"db\"") && db.contains("state: Closed"));
        assert_eq!(m.list(), vec!["cache".to_string(), "db".to_string()]);

        m.force_open("db").unwrap();
        assert_eq!(m.stats("db").unwrap().state, CircuitState::Open);
        let agg = m.aggregate();
        assert_eq!((agg.instances, agg.open, agg.closed), (2, 1, 1));

        m.reset_all();
        assert_eq!(m.aggregate().open, 0);

        assert!(m.force_close("missing").is_err());
        m.remove("cache").unwrap();
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_aggregate_failure_rate_and_metrics() {
        let m = CircuitBreakerManager::default();
        let db = m.create("db", CircuitBreakerConfig::default()).unwrap();
        db.allow().unwrap();
        db.record_failure();
        db.allow().unwrap();
        db.record_success();

        let agg = m.aggregate();
        assert_eq!(agg.requests, 2);
        assert!((agg.overall_failure_rate - 0.5).abs() < 1e-9);

        let text = m.render_metrics();
        assert!(text.contains("circuit_breaker_requests_total{name=\"db\"} 2"));
        assert!(text.contains("circuit_breaker_failure_rate{name=\"db\"} 0.5"));
    }

    #[test]
    fn test_from_configs() {
        let mut configs = BTreeMap::new();
        configs.insert("a".to_string(), CircuitBreakerConfig::new().with_failure_threshold(1));
        configs.insert("b".to_string(), CircuitBreakerConfig::default());
        let m = CircuitBreakerManager::from_configs(&configs).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m.get("a").unwrap().config().failure_threshold, 1);
    }
}
