use parking_lot::RwLock;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::config::LoadShedderConfig;
use super::level::{SheddingLevel, SheddingStrategy};
use crate::metrics::{StatsRecorder, StatsSnapshot};
use crate::sampler::{SystemSampler, SystemSignals};
use crate::worker::BackgroundWorker;
use crate::Result;

/// Rate above which a non-critical level sheds every request.
///
/// Kept for compatibility with existing deployments; callers wanting
/// proportional shedding use [`LoadShedder::should_shed_with_draw`].
pub const COMPAT_SHED_THRESHOLD: f64 = 0.5;

pub(crate) const COMPONENT: &str = "load_shedder";

/// What the shedder knows about an inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub remote_addr: Option<SocketAddr>,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            remote_addr: None,
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn from_request<B>(req: &http::Request<B>) -> Self {
        Self {
            method: req.method().as_str().to_string(),
            path: req.uri().path().to_string(),
            remote_addr: req.extensions().get::<SocketAddr>().copied(),
        }
    }
}

#[derive(Debug)]
struct ShedState {
    level: SheddingLevel,
    rate: f64,
    load: f64,
    signals: SystemSignals,
    last_change: Option<Instant>,
    forced: bool,
    adjustments: u64,
}

impl ShedState {
    fn new(rate: f64) -> Self {
        Self {
            level: SheddingLevel::None,
            rate,
            load: 0.0,
            signals: SystemSignals::default(),
            last_change: None,
            forced: false,
            adjustments: 0,
        }
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShedDecision {
    pub shed: bool,
    pub level: SheddingLevel,
    pub rate: f64,
}

/// Serializable view of a shedder.
#[derive(Debug, Clone, Serialize)]
pub struct ShedderStats {
    pub name: String,
    pub strategy: SheddingStrategy,
    pub level: SheddingLevel,
    pub shed_rate: f64,
    pub load: f64,
    pub signals: SystemSignals,
    pub forced: bool,
    pub adjustments: u64,
    pub requests_total: u64,
    pub requests_shed_total: u64,
    pub level_changes_total: u64,
}

/// Adaptive load shedder.
///
/// A background task samples system pressure every `check_interval`, reduces
/// it to one normalized load value and maps that onto a [`SheddingLevel`].
/// [`should_shed`](Self::should_shed) is a read-locked lookup of the result.
pub struct LoadShedder {
    name: String,
    config: LoadShedderConfig,
    sampler: Arc<SystemSampler>,
    state: RwLock<ShedState>,
    stats: StatsRecorder,
    worker: BackgroundWorker,
}

impl fmt::Debug for LoadShedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (level, rate) = self.current();
        f.debug_struct("LoadShedder")
            .field("name", &self.name)
            .field("strategy", &self.config.strategy)
            .field("level", &level)
            .field("shed_rate", &rate)
            .field("running", &self.is_running())
            .finish()
    }
}

impl LoadShedder {
    pub fn new(
        name: impl Into<String>,
        config: LoadShedderConfig,
        sampler: Arc<SystemSampler>,
    ) -> Result<Self> {
        config.validate()?;
        let name = name.into();
        let stats = StatsRecorder::new(COMPONENT, name.clone());
        let base_rate = config.rate_for(SheddingLevel::None);
        stats.set_gauge("level", 0.0);
        stats.set_gauge("shed_rate", base_rate);
        Ok(Self {
            worker: BackgroundWorker::new(format!("{}:{}", COMPONENT, name)),
            name,
            config,
            sampler,
            state: RwLock::new(ShedState::new(base_rate)),
            stats,
        })
    }

    /// Build a shedder and start its background tasks.
    pub fn spawn(
        name: impl Into<String>,
        config: LoadShedderConfig,
        sampler: Arc<SystemSampler>,
    ) -> Result<Arc<Self>> {
        let shedder = Arc::new(Self::new(name, config, sampler)?);
        shedder.start();
        Ok(shedder)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &LoadShedderConfig {
        &self.config
    }

    pub fn sampler(&self) -> &Arc<SystemSampler> {
        &self.sampler
    }

    pub fn recorder(&self) -> &StatsRecorder {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Start the sampling task and, if enabled, the adaptive adjustment task.
    ///
    /// Tasks hold a weak reference, so dropping the last handle stops them.
    pub fn start(self: &Arc<Self>) {
        if self.worker.is_running() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        self.worker
            .spawn_periodic("sample", self.config.check_interval, move || {
                if let Some(shedder) = weak.upgrade() {
                    shedder.refresh();
                }
                std::future::ready(())
            });

        if self.config.enable_adaptive {
            let weak: Weak<Self> = Arc::downgrade(self);
            self.worker
                .spawn_periodic("adjust", self.config.adjustment_interval, move || {
                    if let Some(shedder) = weak.upgrade() {
                        shedder.adjust();
                    }
                    std::future::ready(())
                });
        }
        info!(
            name = %self.name,
            strategy = %self.config.strategy,
            check_interval_ms = self.config.check_interval.as_millis() as u64,
            "load shedder started"
        );
    }

    /// Stop background tasks and wait for them to exit.
    pub async fn stop(&self) {
        self.worker.stop().await;
        info!(name = %self.name, "load shedder stopped");
    }

    /// Decide whether to reject this request.
    ///
    /// Critical always sheds; below that the request is shed when the current
    /// rate exceeds [`COMPAT_SHED_THRESHOLD`].
    pub fn should_shed(&self, ctx: &RequestContext) -> bool {
        self.should_shed_detailed(ctx).shed
    }

    /// [`should_shed`](Self::should_shed) together with the level and rate
    /// the decision was taken on.
    pub fn should_shed_detailed(&self, ctx: &RequestContext) -> ShedDecision {
        let (level, rate) = self.current();
        let shed = level == SheddingLevel::Critical || rate > COMPAT_SHED_THRESHOLD;
        self.record_decision(ctx, level, shed);
        ShedDecision { shed, level, rate }
    }

    /// Proportional variant: sheds when `draw` (uniform in `[0, 1)`) falls
    /// below the current rate. Critical always sheds.
    pub fn should_shed_with_draw(&self, ctx: &RequestContext, draw: f64) -> bool {
        let (level, rate) = self.current();
        let shed = level == SheddingLevel::Critical || draw < rate;
        self.record_decision(ctx, level, shed);
        shed
    }

    fn current(&self) -> (SheddingLevel, f64) {
        let st = self.state.read();
        (st.level, st.rate)
    }

    fn record_decision(&self, ctx: &RequestContext, level: SheddingLevel, shed: bool) {
        self.stats.incr("requests_total");
        if shed {
            self.stats.incr("requests_shed_total");
            trace!(
                name = %self.name,
                method = %ctx.method,
                path = %ctx.path,
                %level,
                "request shed"
            );
        }
    }

    pub fn current_level(&self) -> SheddingLevel {
        self.state.read().level
    }

    pub fn current_shed_rate(&self) -> f64 {
        self.state.read().rate
    }

    /// Load value computed on the most recent sample.
    pub fn current_load(&self) -> f64 {
        self.state.read().load
    }

    pub fn is_forced(&self) -> bool {
        self.state.read().forced
    }

    /// Reduce signals to one load value in `[0, 1]` according to the strategy.
    pub fn normalized_load(&self, s: &SystemSignals) -> f64 {
        let cfg = &self.config;
        let cpu = unit(s.cpu);
        let memory = unit(s.memory);
        let concurrency = unit(s.concurrency as f64 / cfg.max_concurrency as f64);
        let rate = unit(s.request_rate / cfg.max_request_rate);
        let latency = unit(s.response_time.as_secs_f64() / cfg.max_response_time.as_secs_f64());

        match cfg.strategy {
            SheddingStrategy::Cpu => cpu,
            SheddingStrategy::Memory => memory,
            SheddingStrategy::Concurrency => concurrency,
            SheddingStrategy::RequestRate => rate,
            SheddingStrategy::ResponseTime => latency,
            SheddingStrategy::Combined => {
                0.4 * cpu + 0.3 * memory + 0.2 * concurrency + 0.1 * latency
            }
        }
    }

    /// One sampling step: read signals, compute load, resolve the level.
    pub fn refresh(&self) -> SheddingLevel {
        let signals = self.sampler.sample();
        let load = self.normalized_load(&signals);
        self.record_signals(&signals, load);

        let now = Instant::now();
        let mut st = self.state.write();
        st.signals = signals;
        st.load = load;
        if st.forced {
            return st.level;
        }

        let target = self.config.level_for_load(load);
        if target == st.level {
            return st.level;
        }
        if self.hysteresis_holds(&st, target, load, now) {
            self.stats.incr("hysteresis_suppressed_total");
            debug!(
                name = %self.name,
                current = %st.level,
                target = %target,
                load,
                "level change held by hysteresis"
            );
            return st.level;
        }
        self.apply_level(&mut st, target, now);
        info!(name = %self.name, load, level = %target, rate = st.rate, "shedding level changed");
        st.level
    }

    // A one-step move is held when the previous change is younger than one
    // check interval, or when stepping down before load clears the current
    // threshold by the margin.
    fn hysteresis_holds(
        &self,
        st: &ShedState,
        target: SheddingLevel,
        load: f64,
        now: Instant,
    ) -> bool {
        let margin = self.config.hysteresis;
        if margin <= 0.0 || st.level.distance(target) != 1 {
            return false;
        }
        if let Some(at) = st.last_change {
            if now.duration_since(at) < self.config.check_interval {
                return true;
            }
        }
        if target < st.level {
            if let Some(threshold) = self.config.threshold(st.level) {
                return load > threshold - margin;
            }
        }
        false
    }

    fn apply_level(&self, st: &mut ShedState, level: SheddingLevel, now: Instant) {
        st.level = level;
        st.rate = self.config.rate_for(level);
        st.last_change = Some(now);
        self.stats.incr("level_changes_total");
        self.stats.set_gauge("level", level.as_index() as f64);
        self.stats.set_gauge("shed_rate", st.rate);
    }

    fn record_signals(&self, s: &SystemSignals, load: f64) {
        self.stats.set_gauge("load", load);
        self.stats.set_gauge("cpu_utilization", s.cpu);
        self.stats.set_gauge("memory_utilization", s.memory);
        self.stats.set_gauge("concurrency", s.concurrency as f64);
        self.stats.set_gauge("request_rate", s.request_rate);
        self.stats
            .set_gauge("response_time_seconds", s.response_time.as_secs_f64());
        debug!(
            name = %self.name,
            cpu = s.cpu,
            memory = s.memory,
            concurrency = s.concurrency,
            request_rate = s.request_rate,
            load,
            "sampled system signals"
        );
    }

    /// Administrative override. The level stays pinned until
    /// [`reset`](Self::reset) or [`release_override`](Self::release_override).
    pub fn force_level(&self, level: SheddingLevel) {
        let mut st = self.state.write();
        let from = st.level;
        st.forced = true;
        self.apply_level(&mut st, level, Instant::now());
        self.stats.incr("forced_changes_total");
        warn!(name = %self.name, %from, to = %level, rate = st.rate, "shedding level forced");
    }

    /// Hand control back to the sampler; the next tick recomputes the level.
    pub fn release_override(&self) {
        let mut st = self.state.write();
        if st.forced {
            st.forced = false;
            info!(name = %self.name, level = %st.level, "shedding override released");
        }
    }

    /// Back to level None at its base rate, counters cleared, override released.
    pub fn reset(&self) {
        let mut st = self.state.write();
        st.level = SheddingLevel::None;
        st.rate = self.config.rate_for(SheddingLevel::None);
        st.last_change = None;
        st.forced = false;
        st.adjustments = 0;
        self.stats.set_gauge("level", 0.0);
        self.stats.set_gauge("shed_rate", st.rate);
        info!(name = %self.name, "load shedder reset");
    }

    /// Periodic adaptive bookkeeping.
    pub fn adjust(&self) {
        let requests = self.stats.counter_value("requests_total");
        let shed = self.stats.counter_value("requests_shed_total");
        let observed = if requests == 0 {
            0.0
        } else {
            shed as f64 / requests as f64
        };

        let mut st = self.state.write();
        st.adjustments += 1;
        self.stats.incr("adjustments_total");
        self.stats.set_gauge("observed_shed_ratio", observed);
        debug!(
            name = %self.name,
            adjustments = st.adjustments,
            level = %st.level,
            target_rate = st.rate,
            observed,
            "adaptive adjustment"
        );
    }

    pub fn adjustments(&self) -> u64 {
        self.state.read().adjustments
    }

    pub fn stats(&self) -> ShedderStats {
        let st = self.state.read();
        ShedderStats {
            name: self.name.clone(),
            strategy: self.config.strategy,
            level: st.level,
            shed_rate: st.rate,
            load: st.load,
            signals: st.signals,
            forced: st.forced,
            adjustments: st.adjustments,
            requests_total: self.stats.counter_value("requests_total"),
            requests_shed_total: self.stats.counter_value("requests_shed_total"),
            level_changes_total: self.stats.counter_value("level_changes_total"),
        }
    }

    pub fn metrics_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

fn unit(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}
