//! YAML configuration feeding the managers

mod common;

use resilience_kit::draining::ConnectionTracker;
use resilience_kit::resilience::{CircuitBreakerManager, CircuitState};
use resilience_kit::sampler::ManualProbe;
use resilience_kit::shedding::{LoadSheddingManager, SheddingLevel, SheddingStrategy};
use resilience_kit::ResilienceConfig;
use std::sync::Arc;
use std::time::Duration;

const CONFIG: &str = r#"
shedders:
  public-api:
    strategy: memory
    check_interval_ms: 500
    thresholds:
      light: 0.5
      moderate: 0.6
      heavy: 0.7
      critical: 0.8
  internal:
    enable_adaptive: false
breakers:
  payments:
    failure_threshold: 3
    open_timeout_ms: 10000
  search: {}
drain:
  drain_timeout_ms: 2000
  max_idle_time_ms: 15000
  enable_graceful_close: false
"#;

#[tokio::test]
async fn test_managers_from_yaml() {
    common::init_tracing();
    let cfg = ResilienceConfig::from_yaml_str(CONFIG).unwrap();

    let breakers = CircuitBreakerManager::from_configs(&cfg.breakers).unwrap();
    assert_eq!(breakers.list(), vec!["payments".to_string(), "search".to_string()]);
    let payments = breakers.get("payments").unwrap();
    assert_eq!(payments.config().failure_threshold, 3);
    assert_eq!(payments.config().open_timeout, Duration::from_secs(10));

    for _ in 0..3 {
        payments.allow().unwrap();
        payments.record_failure();
    }
    let agg = breakers.aggregate();
    assert_eq!(agg.open, 1);
    assert_eq!(agg.closed, 1);
    assert_eq!(breakers.stats("payments").unwrap().state, CircuitState::Open);

    let probe = Arc::new(ManualProbe::new(0.0, 0.65));
    let shedders = LoadSheddingManager::new(probe);
    for (name, shed_cfg) in &cfg.shedders {
        shedders.create_stopped(name, shed_cfg.clone()).unwrap();
    }
    let public = shedders.get("public-api").unwrap();
    assert_eq!(public.config().strategy, SheddingStrategy::Memory);
    assert_eq!(public.refresh(), SheddingLevel::Moderate);
    assert_eq!(shedders.get("internal").unwrap().refresh(), SheddingLevel::None);

    let tracker = ConnectionTracker::new("http", cfg.drain.clone()).unwrap();
    assert_eq!(tracker.config().drain_timeout, Duration::from_secs(2));
    assert!(!tracker.config().enable_graceful_close);

    shedders.shutdown().await;
}

#[test]
fn test_load_from_env_path() {
    let dir = std::env::temp_dir().join(format!("resilience-env-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("resilience.yaml");
    std::fs::write(&path, CONFIG).unwrap();

    std::env::set_var("RESILIENCE_CONFIG_PATH", &path);
    let cfg = ResilienceConfig::load().unwrap();
    std::env::remove_var("RESILIENCE_CONFIG_PATH");
    assert_eq!(cfg.shedders.len(), 2);
    assert_eq!(cfg.breakers["payments"].failure_threshold, 3);

    let defaults = ResilienceConfig::load().unwrap();
    assert!(defaults.breakers.is_empty());
    std::fs::remove_dir_all(&dir).ok();
}

#[tokio::test]
async fn test_combined_prometheus_output() {
    let breakers = CircuitBreakerManager::default();
    breakers.get_or_create("db").unwrap().force_open();
    let text = breakers.render_metrics();
    assert!(text.contains("# TYPE circuit_breaker_state gauge"));
    assert!(text.contains("circuit_breaker_state{name=\"db\"} 2"));
    assert!(text.contains("circuit_breaker_state_changes_total{name=\"db\"} 1"));
}
