//! Connection registry and drain controller.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::DrainConfig;
use super::connection::{Connection, ConnectionId};
use crate::metrics::{StatsRecorder, StatsSnapshot};
use crate::worker::BackgroundWorker;
use crate::{Error, Result};

pub(crate) const COMPONENT: &str = "connection_tracker";

/// Roughly 30 years, used when a configured delay does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Progress of the current drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainPhase {
    NotStarted,
    Draining,
    /// Every connection finished before `max_drain_wait`.
    Drained,
    /// Remaining connections were force-closed at `max_drain_wait`.
    ForceClosed,
}

impl DrainPhase {
    pub fn is_finished(self) -> bool {
        matches!(self, DrainPhase::Drained | DrainPhase::ForceClosed)
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub started_at: Instant,
    pub last_activity: Instant,
    pub requests: u64,
    pub idle: bool,
    idle_since: Option<Instant>,
}

impl ConnectionInfo {
    fn new(id: ConnectionId, now: Instant) -> Self {
        Self {
            id,
            started_at: now,
            last_activity: now,
            requests: 0,
            idle: false,
            idle_since: None,
        }
    }

    /// How long the connection has been marked idle.
    pub fn idle_for(&self, now: Instant) -> Option<Duration> {
        self.idle_since.map(|since| now.saturating_duration_since(since))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub active: usize,
    pub idle: usize,
    pub total: usize,
    /// Age of the longest-lived tracked connection.
    pub oldest_age_ms: Option<u64>,
    #[serde(skip)]
    pub oldest_started_at: Option<Instant>,
    pub draining: bool,
    pub phase: DrainPhase,
}

struct Entry {
    conn: Arc<dyn Connection>,
    info: ConnectionInfo,
}

/// Tracks live connections and drives graceful shutdown.
///
/// Once [`start_draining`](Self::start_draining) is called every tracked
/// connection receives a deadline, idle connections are closed as the idle
/// monitor finds them, and the drain completes when the registry is empty or
/// `max_drain_wait` runs out.
pub struct ConnectionTracker {
    name: String,
    config: DrainConfig,
    connections: RwLock<HashMap<ConnectionId, Entry>>,
    count: watch::Sender<usize>,
    draining: AtomicBool,
    phase: watch::Sender<DrainPhase>,
    stats: StatsRecorder,
    worker: BackgroundWorker,
}

impl ConnectionTracker {
    pub fn new(name: impl Into<String>, config: DrainConfig) -> Result<Self> {
        config.validate()?;
        let name = name.into();
        let (count, _) = watch::channel(0);
        let (phase, _) = watch::channel(DrainPhase::NotStarted);
        Ok(Self {
            stats: StatsRecorder::new(COMPONENT, name.clone()),
            worker: BackgroundWorker::new(format!("{}:{}", COMPONENT, name)),
            name,
            config,
            connections: RwLock::new(HashMap::new()),
            count,
            draining: AtomicBool::new(false),
            phase,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &DrainConfig {
        &self.config
    }

    pub fn recorder(&self) -> &StatsRecorder {
        &self.stats
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> DrainPhase {
        *self.phase.borrow()
    }

    /// Register a connection. Connections tracked mid-drain get the drain
    /// deadline straight away.
    pub fn track_connection(&self, conn: Arc<dyn Connection>) {
        let now = Instant::now();
        let id = conn.id();
        {
            let mut map = self.connections.write();
            map.insert(
                id,
                Entry {
                    conn: Arc::clone(&conn),
                    info: ConnectionInfo::new(id, now),
                },
            );
            self.publish_count(map.len());
        }
        self.stats.incr("connections_tracked_total");
        if self.is_draining() {
            conn.set_deadline(deadline_after(now, self.config.drain_timeout));
        }
        debug!(tracker = %self.name, conn = %id, "connection tracked");
    }

    /// Forget a connection without closing it. Returns whether it was tracked.
    pub fn untrack_connection(&self, id: ConnectionId) -> bool {
        let removed = {
            let mut map = self.connections.write();
            let removed = map.remove(&id).is_some();
            self.publish_count(map.len());
            removed
        };
        if removed {
            self.stats.incr("connections_untracked_total");
            debug!(tracker = %self.name, conn = %id, "connection untracked");
        }
        removed
    }

    /// A request arrived on `id`.
    pub fn update_activity(&self, id: ConnectionId) -> bool {
        let mut map = self.connections.write();
        match map.get_mut(&id) {
            Some(entry) => {
                entry.info.last_activity = Instant::now();
                entry.info.requests += 1;
                entry.info.idle = false;
                entry.info.idle_since = None;
                true
            }
            None => false,
        }
    }

    pub fn mark_idle(&self, id: ConnectionId) -> bool {
        let mut map = self.connections.write();
        match map.get_mut(&id) {
            Some(entry) => {
                if !entry.info.idle {
                    entry.info.idle = true;
                    entry.info.idle_since = Some(Instant::now());
                }
                true
            }
            None => false,
        }
    }

    pub fn connection_info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.read().get(&id).map(|e| e.info.clone())
    }

    pub fn total_connections(&self) -> usize {
        self.connections.read().len()
    }

    /// Begin graceful shutdown.
    ///
    /// Fails with [`Error::DrainInProgress`] if a drain was already started
    /// and not cleared with [`reset`](Self::reset).
    pub fn start_draining(self: &Arc<Self>) -> Result<()> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::DrainInProgress);
        }
        self.phase.send_replace(DrainPhase::Draining);
        self.stats.incr("drains_started_total");
        self.stats.set_gauge("draining", 1.0);

        let deadline = deadline_after(Instant::now(), self.config.drain_timeout);
        let conns = self.snapshot_connections();
        for conn in &conns {
            conn.set_deadline(deadline);
        }
        info!(
            tracker = %self.name,
            connections = conns.len(),
            drain_timeout_ms = self.config.drain_timeout.as_millis() as u64,
            "connection drain started"
        );

        // One task runs the idle monitor and waits for completion, so the
        // monitor is gone once the drain has finished.
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut remaining = self.count.subscribe();
        let check_interval = self.config.check_interval;
        let max_wait = self.config.max_drain_wait;
        let started = Instant::now();
        let name = self.name.clone();
        self.worker.spawn(move |stop: CancellationToken| async move {
            let mut idle_check = tokio::time::interval(check_interval);
            idle_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let give_up = tokio::time::sleep(max_wait);
            tokio::pin!(give_up);
            let drained = loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = &mut give_up => break false,
                    res = remaining.wait_for(|n| *n == 0) => break res.is_ok(),
                    _ = idle_check.tick() => match weak.upgrade() {
                        Some(tracker) => {
                            tracker.close_idle_connections();
                        }
                        None => return,
                    },
                }
            };
            if let Some(tracker) = weak.upgrade() {
                tracker.finish_drain(drained, started.elapsed());
            }
            debug!(tracker = %name, "connection drain monitor exited");
        });
        Ok(())
    }

    /// Whether the drain monitor task is still running.
    pub fn is_monitoring(&self) -> bool {
        self.worker.is_running()
    }

    fn finish_drain(&self, drained: bool, took: Duration) {
        if drained {
            self.phase.send_replace(DrainPhase::Drained);
            self.stats.incr("drains_completed_total");
            info!(
                tracker = %self.name,
                took_ms = took.as_millis() as u64,
                "connection drain complete"
            );
        } else {
            let closed = self.force_close_all_connections();
            self.phase.send_replace(DrainPhase::ForceClosed);
            self.stats.incr("drains_timed_out_total");
            warn!(
                tracker = %self.name,
                closed,
                max_drain_wait_ms = self.config.max_drain_wait.as_millis() as u64,
                "connection drain timed out, remaining connections force-closed"
            );
        }
        self.stats.observe("drain_duration_seconds", took.as_secs_f64());
    }

    /// Wait until the current drain finishes.
    ///
    /// Returns immediately if no drain was started. A drain that ended by
    /// force-closing connections reports [`Error::Timeout`].
    pub async fn wait_for_draining(&self, cancel: &CancellationToken) -> Result<()> {
        let mut rx = self.phase.subscribe();
        let phase = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled("connection drain")),
            res = rx.wait_for(|p| *p != DrainPhase::Draining) => match res {
                Ok(phase) => *phase,
                Err(_) => return Err(Error::cancelled("connection drain")),
            },
        };
        match phase {
            DrainPhase::ForceClosed => Err(Error::timeout(
                "connection drain",
                self.config.max_drain_wait,
            )),
            _ => Ok(()),
        }
    }

    /// [`wait_for_draining`](Self::wait_for_draining) bounded by `timeout`.
    pub async fn wait_for_draining_timeout(&self, timeout: Duration) -> Result<()> {
        let never = CancellationToken::new();
        match tokio::time::timeout(timeout, self.wait_for_draining(&never)).await {
            Ok(res) => res,
            Err(_) => Err(Error::timeout("wait for connection drain", timeout)),
        }
    }

    /// Close and forget every tracked connection. Returns how many were closed.
    pub fn force_close_all_connections(&self) -> usize {
        let entries: Vec<Entry> = {
            let mut map = self.connections.write();
            let entries = map.drain().map(|(_, e)| e).collect();
            self.publish_count(0);
            entries
        };
        for entry in &entries {
            entry.conn.close();
        }
        if !entries.is_empty() {
            self.stats.counter("forced_closes_total").add(entries.len() as u64);
            warn!(tracker = %self.name, count = entries.len(), "force-closed connections");
        }
        entries.len()
    }

    /// Close connections idle for at least `max_idle_time` and drop them
    /// from the registry. Returns how many were closed.
    pub fn close_idle_connections(&self) -> usize {
        let now = Instant::now();
        let max_idle = self.config.max_idle_time;
        let victims: Vec<Arc<dyn Connection>> = {
            let mut map = self.connections.write();
            let ids: Vec<ConnectionId> = map
                .values()
                .filter(|e| e.info.idle_for(now).is_some_and(|d| d >= max_idle))
                .map(|e| e.info.id)
                .collect();
            let victims = ids
                .iter()
                .filter_map(|id| map.remove(id))
                .map(|e| e.conn)
                .collect();
            self.publish_count(map.len());
            victims
        };

        for conn in &victims {
            if self.config.enable_graceful_close {
                conn.set_deadline(deadline_after(now, self.config.graceful_close_delay));
            } else {
                conn.close();
            }
        }
        if !victims.is_empty() {
            self.stats.counter("idle_closes_total").add(victims.len() as u64);
            debug!(
                tracker = %self.name,
                count = victims.len(),
                graceful = self.config.enable_graceful_close,
                "closed idle connections"
            );
        }
        victims.len()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        let map = self.connections.read();
        let idle = map.values().filter(|e| e.info.idle).count();
        let oldest = map.values().map(|e| e.info.started_at).min();
        ConnectionStats {
            active: map.len() - idle,
            idle,
            total: map.len(),
            oldest_age_ms: oldest.map(|t| t.elapsed().as_millis() as u64),
            oldest_started_at: oldest,
            draining: self.is_draining(),
            phase: self.phase(),
        }
    }

    /// Stop drain tasks and clear the draining flag. Tracked connections stay.
    pub async fn reset(&self) {
        self.worker.stop().await;
        self.draining.store(false, Ordering::Release);
        self.phase.send_replace(DrainPhase::NotStarted);
        self.stats.set_gauge("draining", 0.0);
        info!(tracker = %self.name, "connection tracker reset");
    }

    pub fn metrics_snapshot(&self) -> StatsSnapshot {
        let stats = self.connection_stats();
        self.stats.set_gauge("connections_active", stats.active as f64);
        self.stats.set_gauge("connections_idle", stats.idle as f64);
        self.stats.set_gauge("connections_total", stats.total as f64);
        self.stats.snapshot()
    }

    fn snapshot_connections(&self) -> Vec<Arc<dyn Connection>> {
        self.connections
            .read()
            .values()
            .map(|e| Arc::clone(&e.conn))
            .collect()
    }

    fn publish_count(&self, n: usize) {
        self.count.send_replace(n);
    }
}
