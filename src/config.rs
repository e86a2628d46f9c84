//! File-backed configuration for all guards.
//!
//! ```yaml
//! shedders:
//!   api:
//!     strategy: combined
//!     check_interval_ms: 1000
//! breakers:
//!   payments:
//!     failure_threshold: 5
//!     open_timeout_ms: 30000
//! drain:
//!   drain_timeout_ms: 5000
//!   max_drain_wait_ms: 30000
//! ```
//!
//! Every field is optional; omitted fields take their defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::draining::DrainConfig;
use crate::registry::validate_name;
use crate::resilience::CircuitBreakerConfig;
use crate::shedding::LoadShedderConfig;
use crate::{Error, ErrorContext, Result};

/// Environment variable naming a YAML file for [`ResilienceConfig::load`].
pub const CONFIG_PATH_ENV: &str = "RESILIENCE_CONFIG_PATH";

/// Serialize a [`Duration`](std::time::Duration) as whole milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub shedders: BTreeMap<String, LoadShedderConfig>,
    pub breakers: BTreeMap<String, CircuitBreakerConfig>,
    pub drain: DrainConfig,
}

impl ResilienceConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let cfg = Self::from_yaml_str(&text).map_err(|e| match e {
            Error::Yaml(inner) => Error::configuration_with_context(
                format!("failed to parse config: {}", inner),
                ErrorContext::new()
                    .with_field_path(path.display().to_string())
                    .with_source("config_file"),
            ),
            other => other,
        })?;
        info!(
            path = %path.display(),
            shedders = cfg.shedders.len(),
            breakers = cfg.breakers.len(),
            "loaded resilience config"
        );
        Ok(cfg)
    }

    /// Read the file named by `RESILIENCE_CONFIG_PATH`, or defaults when unset.
    pub fn load() -> Result<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(path.trim()),
            _ => {
                debug!("{} not set, using default resilience config", CONFIG_PATH_ENV);
                Ok(Self::default())
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, cfg) in &self.shedders {
            validate_name(name, "config.shedders")?;
            cfg.validate()?;
        }
        for (name, cfg) in &self.breakers {
            validate_name(name, "config.breakers")?;
            cfg.validate()?;
        }
        self.drain.validate()
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shedding::SheddingStrategy;
    use std::time::Duration;

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let cfg = ResilienceConfig::from_yaml_str(
            r#"
shedders:
  api:
    strategy: cpu
    check_interval_ms: 250
breakers:
  payments:
    failure_threshold: 2
drain:
  max_drain_wait_ms: 1000
"#,
        )
        .unwrap();

        let api = &cfg.shedders["api"];
        assert_eq!(api.strategy, SheddingStrategy::Cpu);
        assert_eq!(api.check_interval, Duration::from_millis(250));
        assert_eq!(api.adjustment_interval, Duration::from_secs(30));

        let payments = &cfg.breakers["payments"];
        assert_eq!(payments.failure_threshold, 2);
        assert_eq!(payments.success_threshold, 3);

        assert_eq!(cfg.drain.max_drain_wait, Duration::from_secs(1));
        assert_eq!(cfg.drain.drain_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_rejects_bad_names_and_values() {
        let err = ResilienceConfig::from_yaml_str("breakers:\n  \"bad name\": {}\n").unwrap_err();
        assert!(err.is_configuration());

        let err =
            ResilienceConfig::from_yaml_str("breakers:\n  ok:\n    failure_threshold: 0\n")
                .unwrap_err();
        assert!(err.is_configuration());

        let err = ResilienceConfig::from_yaml_str("shedders: [1, 2]").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_yaml_round_trip_keeps_durations() {
        let mut cfg = ResilienceConfig::default();
        cfg.breakers.insert(
            "db".into(),
            CircuitBreakerConfig::new().with_open_timeout(Duration::from_millis(1500)),
        );
        let text = cfg.to_yaml().unwrap();
        assert!(text.contains("open_timeout_ms: 1500"));
        let back = ResilienceConfig::from_yaml_str(&text).unwrap();
        assert_eq!(back.breakers["db"].open_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn test_from_file_reports_path() {
        let dir = std::env::temp_dir().join(format!("resilience-cfg-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken.yaml");
        std::fs::write(&path, "drain: [").unwrap();

        let err = ResilienceConfig::from_file(&path).unwrap_err();
        assert!(err.is_configuration());
        let ctx = err.context().unwrap();
        assert!(ctx.field_path.as_deref().unwrap().ends_with("broken.yaml"));

        assert!(ResilienceConfig::from_file(dir.join("missing.yaml")).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
