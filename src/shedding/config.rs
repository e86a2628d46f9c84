use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::level::{SheddingLevel, SheddingStrategy};
use crate::config::duration_ms;
use crate::{Error, ErrorContext, Result};

/// Load value at or above which each level applies.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelThresholds {
    pub light: f64,
    pub moderate: f64,
    pub heavy: f64,
    pub critical: f64,
}

impl Default for LevelThresholds {
    fn default() -> Self {
        Self {
            light: 0.6,
            moderate: 0.75,
            heavy: 0.85,
            critical: 0.95,
        }
    }
}

/// Fraction of requests to shed at each level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShedRates {
    pub light: f64,
    pub moderate: f64,
    pub heavy: f64,
    pub critical: f64,
}

impl Default for ShedRates {
    fn default() -> Self {
        Self {
            light: 0.1,
            moderate: 0.3,
            heavy: 0.6,
            critical: 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadShedderConfig {
    pub strategy: SheddingStrategy,
    pub thresholds: LevelThresholds,
    pub shed_rates: ShedRates,
    #[serde(rename = "check_interval_ms", with = "duration_ms")]
    pub check_interval: Duration,
    #[serde(rename = "adjustment_interval_ms", with = "duration_ms")]
    pub adjustment_interval: Duration,
    /// Damping margin around thresholds; zero disables hysteresis.
    pub hysteresis: f64,
    pub min_shed_rate: f64,
    pub max_shed_rate: f64,
    pub enable_adaptive: bool,
    /// In-flight count that normalizes to a concurrency signal of 1.0.
    pub max_concurrency: usize,
    /// Requests per second that normalize to a rate signal of 1.0.
    pub max_request_rate: f64,
    /// Mean response time that normalizes to a latency signal of 1.0.
    #[serde(rename = "max_response_time_ms", with = "duration_ms")]
    pub max_response_time: Duration,
}

impl Default for LoadShedderConfig {
    fn default() -> Self {
        Self {
            strategy: SheddingStrategy::Combined,
            thresholds: LevelThresholds::default(),
            shed_rates: ShedRates::default(),
            check_interval: Duration::from_secs(1),
            adjustment_interval: Duration::from_secs(30),
            hysteresis: 0.05,
            min_shed_rate: 0.0,
            max_shed_rate: 0.95,
            enable_adaptive: true,
            max_concurrency: 10_000,
            max_request_rate: 1_000.0,
            max_response_time: Duration::from_secs(1),
        }
    }
}

impl LoadShedderConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategy(mut self, strategy: SheddingStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_thresholds(mut self, thresholds: LevelThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_shed_rates(mut self, rates: ShedRates) -> Self {
        self.shed_rates = rates;
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_adjustment_interval(mut self, interval: Duration) -> Self {
        self.adjustment_interval = interval;
        self
    }

    pub fn with_hysteresis(mut self, margin: f64) -> Self {
        self.hysteresis = margin;
        self
    }

    pub fn with_shed_rate_bounds(mut self, min: f64, max: f64) -> Self {
        self.min_shed_rate = min;
        self.max_shed_rate = max;
        self
    }

    pub fn with_adaptive(mut self, enabled: bool) -> Self {
        self.enable_adaptive = enabled;
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_max_request_rate(mut self, rps: f64) -> Self {
        self.max_request_rate = rps;
        self
    }

    pub fn with_max_response_time(mut self, max: Duration) -> Self {
        self.max_response_time = max;
        self
    }

    /// Threshold a load must reach for `level`; `None` for the base level.
    pub fn threshold(&self, level: SheddingLevel) -> Option<f64> {
        match level {
            SheddingLevel::None => None,
            SheddingLevel::Light => Some(self.thresholds.light),
            SheddingLevel::Moderate => Some(self.thresholds.moderate),
            SheddingLevel::Heavy => Some(self.thresholds.heavy),
            SheddingLevel::Critical => Some(self.thresholds.critical),
        }
    }

    /// Configured rate for `level`, clamped into `[min_shed_rate, max_shed_rate]`.
    ///
    /// The base level is zero before clamping, so it only sheds when
    /// `min_shed_rate` is raised above zero.
    pub fn rate_for(&self, level: SheddingLevel) -> f64 {
        let raw = match level {
            SheddingLevel::None => 0.0,
            SheddingLevel::Light => self.shed_rates.light,
            SheddingLevel::Moderate => self.shed_rates.moderate,
            SheddingLevel::Heavy => self.shed_rates.heavy,
            SheddingLevel::Critical => self.shed_rates.critical,
        };
        raw.clamp(self.min_shed_rate, self.max_shed_rate)
    }

    /// Highest level whose threshold `load` reaches, testing Critical first.
    pub fn level_for_load(&self, load: f64) -> SheddingLevel {
        SheddingLevel::ALL
            .into_iter()
            .rev()
            .find(|l| self.threshold(*l).map_or(true, |t| load >= t))
            .unwrap_or(SheddingLevel::None)
    }

    pub fn validate(&self) -> Result<()> {
        let t = &self.thresholds;
        let thresholds = [t.light, t.moderate, t.heavy, t.critical];
        check_unit("thresholds", &thresholds)?;
        if !thresholds.windows(2).all(|w| w[0] < w[1]) {
            return Err(invalid(
                "thresholds",
                format!("must be strictly increasing, got {:?}", thresholds),
            ));
        }

        let r = &self.shed_rates;
        let rates = [r.light, r.moderate, r.heavy, r.critical];
        check_unit("shed_rates", &rates)?;
        if !rates.windows(2).all(|w| w[0] <= w[1]) {
            return Err(invalid(
                "shed_rates",
                format!("must be non-decreasing, got {:?}", rates),
            ));
        }

        check_unit("min_shed_rate", &[self.min_shed_rate])?;
        check_unit("max_shed_rate", &[self.max_shed_rate])?;
        if self.min_shed_rate > self.max_shed_rate {
            return Err(invalid(
                "min_shed_rate",
                format!("{} exceeds max_shed_rate {}", self.min_shed_rate, self.max_shed_rate),
            ));
        }
        check_unit("hysteresis", &[self.hysteresis])?;

        if self.check_interval.is_zero() {
            return Err(invalid("check_interval_ms", "must be non-zero"));
        }
        if self.enable_adaptive && self.adjustment_interval.is_zero() {
            return Err(invalid("adjustment_interval_ms", "must be non-zero"));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("max_concurrency", "must be non-zero"));
        }
        if !(self.max_request_rate > 0.0) {
            return Err(invalid("max_request_rate", "must be positive"));
        }
        if self.max_response_time.is_zero() {
            return Err(invalid("max_response_time_ms", "must be non-zero"));
        }
        Ok(())
    }
}

fn check_unit(field: &str, values: &[f64]) -> Result<()> {
    match values.iter().find(|v| !(0.0..=1.0).contains(*v)) {
        Some(v) => Err(invalid(field, format!("{} is outside [0, 1]", v))),
        None => Ok(()),
    }
}

fn invalid(field: &str, details: impl Into<String>) -> Error {
    Error::validation_with_context(
        "invalid load shedder configuration",
        ErrorContext::new()
            .with_field_path(field)
            .with_details(details)
            .with_source("shedder_config"),
    )
}
