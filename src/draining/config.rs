use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::duration_ms;
use crate::{Error, ErrorContext, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    /// Deadline pushed to every tracked connection when a drain starts.
    #[serde(rename = "drain_timeout_ms", with = "duration_ms")]
    pub drain_timeout: Duration,
    /// Longest a drain may take before remaining connections are force-closed.
    #[serde(rename = "max_drain_wait_ms", with = "duration_ms")]
    pub max_drain_wait: Duration,
    /// Idle-check period while draining.
    #[serde(rename = "check_interval_ms", with = "duration_ms")]
    pub check_interval: Duration,
    #[serde(rename = "max_idle_time_ms", with = "duration_ms")]
    pub max_idle_time: Duration,
    #[serde(rename = "graceful_close_delay_ms", with = "duration_ms")]
    pub graceful_close_delay: Duration,
    /// Idle connections get a short deadline instead of an immediate close.
    pub enable_graceful_close: bool,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(5),
            max_drain_wait: Duration::from_secs(30),
            check_interval: Duration::from_secs(1),
            max_idle_time: Duration::from_secs(60),
            graceful_close_delay: Duration::from_secs(1),
            enable_graceful_close: true,
        }
    }
}

impl DrainConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_max_drain_wait(mut self, wait: Duration) -> Self {
        self.max_drain_wait = wait;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time = idle;
        self
    }

    pub fn with_graceful_close(mut self, enabled: bool, delay: Duration) -> Self {
        self.enable_graceful_close = enabled;
        self.graceful_close_delay = delay;
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str| {
            Err(Error::validation_with_context(
                "invalid drain configuration",
                ErrorContext::new()
                    .with_field_path(field)
                    .with_details("must be non-zero")
                    .with_source("drain_config"),
            ))
        };
        if self.check_interval.is_zero() {
            return invalid("check_interval_ms");
        }
        if self.max_drain_wait.is_zero() {
            return invalid("max_drain_wait_ms");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_validation() {
        let cfg = DrainConfig::default();
        assert_eq!(cfg.drain_timeout, Duration::from_secs(5));
        assert_eq!(cfg.max_drain_wait, Duration::from_secs(30));
        assert!(cfg.enable_graceful_close);
        assert!(cfg.validate().is_ok());

        let zero = DrainConfig::new().with_check_interval(Duration::ZERO);
        let err = zero.validate().unwrap_err();
        assert_eq!(
            err.context().unwrap().field_path.as_deref(),
            Some("check_interval_ms")
        );
    }
}
