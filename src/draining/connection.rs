//! Connections as seen by the tracker.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Process-unique id.
    pub fn next() -> Self {
        ConnectionId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A live client connection that can be told to wind down.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Close immediately.
    fn close(&self);

    /// Ask the connection to finish by `deadline`. A later call replaces an
    /// earlier deadline.
    fn set_deadline(&self, deadline: Instant);
}

/// [`Connection`] for tokio serving loops.
///
/// The loop selects on [`closed`](Self::closed), which resolves when the
/// handle is closed or its deadline passes.
///
/// ```rust
/// use resilience_kit::draining::ConnectionHandle;
///
/// # async fn serve(handle: std::sync::Arc<ConnectionHandle>) {
/// loop {
///     tokio::select! {
///         _ = handle.closed() => break,
///         // read the next request ...
///         _ = tokio::task::yield_now() => {}
///     }
/// }
/// # }
/// ```
pub struct ConnectionHandle {
    id: ConnectionId,
    token: CancellationToken,
    deadline: watch::Sender<Option<Instant>>,
    closed_at: Mutex<Option<Instant>>,
}

impl Default for ConnectionHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionHandle {
    pub fn new() -> Self {
        Self::with_id(ConnectionId::next())
    }

    pub fn with_id(id: ConnectionId) -> Self {
        let (deadline, _) = watch::channel(None);
        Self {
            id,
            token: CancellationToken::new(),
            deadline,
            closed_at: Mutex::new(None),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Closed, or past its deadline.
    pub fn is_finished(&self) -> bool {
        self.is_closed() || self.deadline().is_some_and(|d| Instant::now() >= d)
    }

    /// When [`close`](Connection::close) was first called.
    pub fn closed_at(&self) -> Option<Instant> {
        *self.closed_at.lock()
    }

    pub async fn closed(&self) {
        let mut rx = self.deadline.subscribe();
        loop {
            let deadline = *rx.borrow_and_update();
            match deadline {
                Some(at) => tokio::select! {
                    _ = self.token.cancelled() => return,
                    _ = tokio::time::sleep_until(at) => return,
                    _ = rx.changed() => {}
                },
                None => tokio::select! {
                    _ = self.token.cancelled() => return,
                    _ = rx.changed() => {}
                },
            }
        }
    }
}

impl Connection for ConnectionHandle {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn close(&self) {
        self.closed_at.lock().get_or_insert_with(Instant::now);
        self.token.cancel();
    }

    fn set_deadline(&self, deadline: Instant) {
        self.deadline.send_replace(Some(deadline));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("conn-"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_resolves_at_deadline() {
        let handle = Arc::new(ConnectionHandle::new());
        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.closed().await })
        };
        tokio::task::yield_now().await;
        handle.set_deadline(Instant::now() + Duration::from_secs(2));

        let started = Instant::now();
        waiter.await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(handle.is_finished());
        assert!(!handle.is_closed());
    }

    #[test]
    fn test_closed_pending_until_close() {
        let handle = ConnectionHandle::new();
        let mut closed = tokio_test::task::spawn(handle.closed());
        tokio_test::assert_pending!(closed.poll());
        handle.close();
        assert!(closed.is_woken());
        tokio_test::assert_ready!(closed.poll());
    }

    #[tokio::test]
    async fn test_close_wakes_waiter() {
        let handle = Arc::new(ConnectionHandle::new());
        let waiter = {
            let handle = Arc::clone(&handle);
            tokio::spawn(async move { handle.closed().await })
        };
        handle.close();
        waiter.await.unwrap();
        assert!(handle.is_closed());
        assert!(handle.closed_at().is_some());
    }
}
