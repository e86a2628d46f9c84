//! Background periodic tasks with a synchronous stop.
//!
//! A [`BackgroundWorker`] owns a cancellation token (the stop signal) and the
//! join handles of every task it spawned (the completion signal). `stop()`
//! returns only after all tasks have exited.

use parking_lot::Mutex;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct BackgroundWorker {
    name: String,
    token: Mutex<CancellationToken>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            token: Mutex::new(CancellationToken::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Token observed by the tasks of the current generation.
    pub fn token(&self) -> CancellationToken {
        self.token.lock().clone()
    }

    /// Whether at least one spawned task has not yet finished.
    pub fn is_running(&self) -> bool {
        self.handles.lock().iter().any(|h| !h.is_finished())
    }

    /// Spawn a task that runs `tick` every `period` until stopped.
    ///
    /// The first tick fires immediately.
    pub fn spawn_periodic<F, Fut>(&self, task: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token();
        let worker = self.name.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            debug!(worker = %worker, task, "background task exited");
        });
        self.handles.lock().push(handle);
    }

    /// Spawn a one-shot task that receives the stop token.
    pub fn spawn<F, Fut>(&self, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(f(self.token()));
        self.handles.lock().push(handle);
    }

    /// Signal every task to exit and wait until they have.
    ///
    /// The worker can be started again afterwards with a fresh token.
    pub async fn stop(&self) {
        let token = {
            let mut guard = self.token.lock();
            std::mem::replace(&mut *guard, CancellationToken::new())
        };
        token.cancel();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            // A panicked or aborted task has exited as well.
            let _ = handle.await;
        }
    }
}

impl Drop for BackgroundWorker {
    fn drop(&mut self) {
        self.token.get_mut().cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_ticks_until_stopped() {
        let worker = BackgroundWorker::new("test");
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);
        worker.spawn_periodic("count", Duration::from_secs(1), move || {
            let t = Arc::clone(&t);
            async move {
                t.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(worker.is_running());
        worker.stop().await;
        assert!(!worker.is_running());

        let seen = ticks.load(Ordering::SeqCst);
        assert_eq!(seen, 4);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_stop_without_tasks_is_noop() {
        let worker = BackgroundWorker::new("idle");
        worker.stop().await;
        assert!(!worker.is_running());
    }
}
