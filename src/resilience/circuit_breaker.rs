use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::duration_ms;
use crate::error::BoxError;
use crate::metrics::{StatsRecorder, StatsSnapshot};
use crate::{Error, ErrorContext, Result};

pub(crate) const COMPONENT: &str = "circuit_breaker";

/// Decides whether an operation error counts against the breaker.
/// Returning `false` records the call as a success while still handing the
/// error back to the caller.
pub type FailureClassifier =
    Arc<dyn Fn(&(dyn std::error::Error + Send + Sync + 'static)) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: closed 0, half-open 1, open 2.
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Half-open successes that close the breaker again.
    pub success_threshold: u32,
    /// Time spent open before the next call is let through as a probe.
    #[serde(rename = "open_timeout_ms", with = "duration_ms")]
    pub open_timeout: Duration,
    /// Longest the breaker may stay half-open without closing.
    #[serde(rename = "half_open_timeout_ms", with = "duration_ms")]
    pub half_open_timeout: Duration,
    /// Deadline applied to each guarded call.
    #[serde(rename = "call_timeout_ms", with = "duration_ms")]
    pub call_timeout: Duration,
    #[serde(skip)]
    pub failure_classifier: Option<FailureClassifier>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_timeout: Duration::from_secs(30),
            half_open_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(10),
            failure_classifier: None,
        }
    }
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("success_threshold", &self.success_threshold)
            .field("open_timeout", &self.open_timeout)
            .field("half_open_timeout", &self.half_open_timeout)
            .field("call_timeout", &self.call_timeout)
            .field("failure_classifier", &self.failure_classifier.is_some())
            .finish()
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Alias for with_open_timeout
    pub fn with_reset_timeout(self, timeout: Duration) -> Self {
        self.with_open_timeout(timeout)
    }

    pub fn with_half_open_timeout(mut self, timeout: Duration) -> Self {
        self.half_open_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_failure_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&(dyn std::error::Error + Send + Sync + 'static)) -> bool + Send + Sync + 'static,
    {
        self.failure_classifier = Some(Arc::new(classifier));
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, details: &str| {
            Err(Error::validation_with_context(
                "invalid circuit breaker configuration",
                ErrorContext::new()
                    .with_field_path(field)
                    .with_details(details)
                    .with_source("breaker_config"),
            ))
        };
        if self.failure_threshold == 0 {
            return invalid("failure_threshold", "must be at least 1");
        }
        if self.success_threshold == 0 {
            return invalid("success_threshold", "must be at least 1");
        }
        if self.call_timeout.is_zero() {
            return invalid("call_timeout_ms", "must be non-zero");
        }
        if self.half_open_timeout.is_zero() {
            return invalid("half_open_timeout_ms", "must be non-zero");
        }
        Ok(())
    }
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    last_state_change: Instant,
    forced: bool,
    consecutive_failures: u32,
    half_open_successes: u32,
    requests: u64,
    successes: u64,
    failures: u64,
    rejections: u64,
}

impl State {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            last_state_change: Instant::now(),
            forced: false,
            consecutive_failures: 0,
            half_open_successes: 0,
            requests: 0,
            successes: 0,
            failures: 0,
            rejections: 0,
        }
    }

    fn clear_counts(&mut self) {
        self.consecutive_failures = 0;
        self.half_open_successes = 0;
        self.requests = 0;
        self.successes = 0;
        self.failures = 0;
        self.rejections = 0;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub forced: bool,
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
    /// Failures over attempted (non-rejected) calls.
    pub failure_rate: f64,
    pub success_rate: f64,
    pub since_state_change_ms: u64,
    /// Remaining open time in ms, if currently open on a timer.
    pub open_remaining_ms: Option<u64>,
}

enum Outcome<T> {
    Finished(std::result::Result<T, BoxError>),
    TimedOut,
    Cancelled,
}

/// Circuit breaker guarding one downstream dependency.
///
/// - Closed: calls pass; consecutive failures are counted
/// - Open: calls are rejected until `open_timeout` has elapsed
/// - HalfOpen: calls probe the dependency; one failure reopens,
///   `success_threshold` successes close
pub struct CircuitBreaker {
    name: String,
    guard: String,
    cfg: CircuitBreakerConfig,
    state: RwLock<State>,
    stats: StatsRecorder,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.cfg)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, cfg: CircuitBreakerConfig) -> Result<Self> {
        cfg.validate()?;
        let name = name.into();
        let stats = StatsRecorder::new(COMPONENT, name.clone());
        stats.set_gauge("state", CircuitState::Closed.as_gauge());
        Ok(Self {
            guard: format!("{}:{}", COMPONENT, name),
            name,
            cfg,
            state: RwLock::new(State::new()),
            stats,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.cfg
    }

    pub fn recorder(&self) -> &StatsRecorder {
        &self.stats
    }

    pub fn state(&self) -> CircuitState {
        self.state.read().state
    }

    /// Run `op` through the breaker.
    ///
    /// Rejected calls never invoke `op`. Errors from `op` come back as
    /// [`Error::OperationFailed`]; the per-call deadline as [`Error::Timeout`].
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        self.run(None, op).await
    }

    /// Like [`execute`](Self::execute), aborting `op` as soon as `cancel`
    /// fires. A cancelled call counts as a failure.
    pub async fn execute_with_cancel<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        self.run(Some(cancel), op).await
    }

    async fn run<T, E, F, Fut>(&self, cancel: Option<&CancellationToken>, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<BoxError>,
    {
        self.allow()?;

        let started = Instant::now();
        let call = async {
            match tokio::time::timeout(self.cfg.call_timeout, op()).await {
                Ok(res) => Outcome::Finished(res.map_err(Into::into)),
                Err(_) => Outcome::TimedOut,
            }
        };
        let outcome = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Outcome::Cancelled,
                out = call => out,
            },
            None => call.await,
        };
        self.stats
            .observe("call_duration_seconds", started.elapsed().as_secs_f64());

        match outcome {
            Outcome::Finished(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Outcome::Finished(Err(source)) => {
                if self.is_failure(&*source) {
                    self.record_failure();
                } else {
                    self.record_success();
                }
                Err(Error::OperationFailed {
                    guard: self.guard.clone(),
                    source,
                })
            }
            Outcome::TimedOut => {
                self.stats.incr("timeouts_total");
                self.record_failure();
                Err(Error::timeout(self.guard.clone(), self.cfg.call_timeout))
            }
            Outcome::Cancelled => {
                self.stats.incr("cancellations_total");
                self.record_failure();
                Err(Error::cancelled(self.guard.clone()))
            }
        }
    }

    fn is_failure(&self, err: &(dyn std::error::Error + Send + Sync + 'static)) -> bool {
        match &self.cfg.failure_classifier {
            Some(classify) => classify(err),
            None => true,
        }
    }

    /// Admit or reject one call, performing the timer-driven transitions.
    ///
    /// Callers that use this directly must report the outcome with
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn allow(&self) -> Result<()> {
        let now = Instant::now();
        let mut st = self.state.write();
        st.requests += 1;
        self.stats.incr("requests_total");

        match st.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let open_for = now.duration_since(st.last_state_change);
                if !st.forced && open_for >= self.cfg.open_timeout {
                    self.transition(&mut st, CircuitState::HalfOpen, now);
                    return Ok(());
                }
                let reason = if st.forced {
                    "circuit forced open".to_string()
                } else {
                    format!(
                        "circuit open, retry in {}ms",
                        (self.cfg.open_timeout - open_for).as_millis()
                    )
                };
                Err(self.reject(&mut st, reason))
            }
            CircuitState::HalfOpen => {
                if now.duration_since(st.last_state_change) >= self.cfg.half_open_timeout {
                    warn!(name = %self.name, "half-open probe window expired, reopening");
                    self.transition(&mut st, CircuitState::Open, now);
                    return Err(self.reject(&mut st, "half-open probe window expired".to_string()));
                }
                Ok(())
            }
        }
    }

    fn reject(&self, st: &mut State, reason: String) -> Error {
        st.rejections += 1;
        self.stats.incr("rejected_total");
        Error::rejected(self.guard.clone(), reason)
    }

    /// Check if a request is allowed (boolean form of [`allow`](Self::allow))
    pub fn allow_request(&self) -> bool {
        self.allow().is_ok()
    }

    pub fn record_success(&self) {
        let mut st = self.state.write();
        st.successes += 1;
        self.stats.incr("successes_total");
        match st.state {
            CircuitState::Closed => st.consecutive_failures = 0,
            CircuitState::HalfOpen => {
                st.half_open_successes = st.half_open_successes.saturating_add(1);
                if st.half_open_successes >= self.cfg.success_threshold {
                    self.transition(&mut st, CircuitState::Closed, Instant::now());
                }
            }
            // Late completion of a call admitted before the breaker opened.
            CircuitState::Open => {}
        }
        self.update_rates(&st);
    }

    pub fn record_failure(&self) {
        let mut st = self.state.write();
        st.failures += 1;
        self.stats.incr("failures_total");
        match st.state {
            CircuitState::Closed => {
                st.consecutive_failures = st.consecutive_failures.saturating_add(1);
                if st.consecutive_failures >= self.cfg.failure_threshold {
                    self.transition(&mut st, CircuitState::Open, Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                self.transition(&mut st, CircuitState::Open, Instant::now());
            }
            CircuitState::Open => {}
        }
        self.update_rates(&st);
    }

    fn transition(&self, st: &mut State, to: CircuitState, now: Instant) {
        let from = st.state;
        st.state = to;
        st.last_state_change = now;
        st.consecutive_failures = 0;
        st.half_open_successes = 0;

        self.stats.incr("state_changes_total");
        match to {
            CircuitState::Open => self.stats.incr("opened_total"),
            CircuitState::HalfOpen => self.stats.incr("half_opened_total"),
            CircuitState::Closed => self.stats.incr("closed_total"),
        }
        self.stats.set_gauge("state", to.as_gauge());

        if to == CircuitState::Open {
            warn!(name = %self.name, %from, %to, "circuit breaker opened");
        } else {
            info!(name = %self.name, %from, %to, "circuit breaker state changed");
        }
    }

    fn update_rates(&self, st: &State) {
        let attempted = st.successes + st.failures;
        if attempted > 0 {
            self.stats
                .set_gauge("failure_rate", st.failures as f64 / attempted as f64);
            self.stats
                .set_gauge("success_rate", st.successes as f64 / attempted as f64);
        }
    }

    fn set_administratively(&self, to: CircuitState, forced: bool, action: &str) {
        let mut st = self.state.write();
        let from = st.state;
        st.clear_counts();
        st.forced = forced;
        if from != to {
            self.transition(&mut st, to, Instant::now());
        } else {
            st.last_state_change = Instant::now();
        }
        self.stats.set_gauge("failure_rate", 0.0);
        self.stats.set_gauge("success_rate", 0.0);
        warn!(name = %self.name, %from, %to, action, "circuit breaker overridden");
    }

    /// Back to Closed with all counters cleared.
    pub fn reset(&self) {
        self.set_administratively(CircuitState::Closed, false, "reset");
    }

    /// Open the breaker until [`force_close`](Self::force_close) or
    /// [`reset`](Self::reset); the open timeout does not apply.
    pub fn force_open(&self) {
        self.set_administratively(CircuitState::Open, true, "force_open");
    }

    pub fn force_close(&self) {
        self.set_administratively(CircuitState::Closed, false, "force_close");
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let st = self.state.read();
        let attempted = st.successes + st.failures;
        let rate = |n: u64| {
            if attempted == 0 {
                0.0
            } else {
                n as f64 / attempted as f64
            }
        };
        let since = st.last_state_change.elapsed();
        let open_remaining_ms = if st.state == CircuitState::Open && !st.forced {
            self.cfg
                .open_timeout
                .checked_sub(since)
                .map(|d| d.as_millis() as u64)
        } else {
            None
        };
        CircuitBreakerStats {
            name: self.name.clone(),
            state: st.state,
            forced: st.forced,
            requests: st.requests,
            successes: st.successes,
            failures: st.failures,
            rejections: st.rejections,
            consecutive_failures: st.consecutive_failures,
            half_open_successes: st.half_open_successes,
            failure_rate: rate(st.failures),
            success_rate: rate(st.successes),
            since_state_change_ms: since.as_millis() as u64,
            open_remaining_ms,
        }
    }

    pub fn metrics_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
