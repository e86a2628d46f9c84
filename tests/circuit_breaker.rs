//! Circuit breaker lifecycle under a paused clock

mod common;

use resilience_kit::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use resilience_kit::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn breaker() -> CircuitBreaker {
    common::init_tracing();
    let config = CircuitBreakerConfig::new()
        .with_failure_threshold(5)
        .with_success_threshold(3)
        .with_open_timeout(Duration::from_secs(30))
        .with_half_open_timeout(Duration::from_secs(10));
    CircuitBreaker::new("payments", config).unwrap()
}

async fn fail(cb: &CircuitBreaker) -> Error {
    cb.execute(|| async { Err::<(), _>(std::io::Error::other("connection refused")) })
        .await
        .unwrap_err()
}

async fn succeed(cb: &CircuitBreaker) {
    cb.execute(|| async { Ok::<_, std::io::Error>(()) })
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_full_open_half_open_close_cycle() {
    let cb = breaker();

    for i in 0..5 {
        let err = fail(&cb).await;
        assert!(err.is_operation_failure(), "call {} should surface the op error", i);
    }
    assert_eq!(cb.state(), CircuitState::Open);
    assert_eq!(cb.recorder().counter_value("opened_total"), 1);

    // Sixth call is rejected without running.
    let ran = AtomicUsize::new(0);
    let err = cb
        .execute(|| async {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok::<_, std::io::Error>(())
        })
        .await
        .unwrap_err();
    assert!(err.is_rejection());
    assert_eq!(ran.load(Ordering::SeqCst), 0);

    // Still open just before the timeout.
    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(fail(&cb).await.is_rejection());
    assert_eq!(cb.recorder().counter_value("opened_total"), 1);

    tokio::time::advance(Duration::from_millis(1001)).await;
    succeed(&cb).await;
    assert_eq!(cb.state(), CircuitState::HalfOpen);
    succeed(&cb).await;
    succeed(&cb).await;
    assert_eq!(cb.state(), CircuitState::Closed);

    let stats = cb.stats();
    assert_eq!(stats.rejections, 2);
    assert_eq!(stats.consecutive_failures, 0);
    assert_eq!(cb.recorder().counter_value("state_changes_total"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_single_half_open_failure_reopens() {
    let cb = breaker();
    for _ in 0..5 {
        fail(&cb).await;
    }
    tokio::time::advance(Duration::from_secs(30)).await;

    succeed(&cb).await;
    succeed(&cb).await;
    assert_eq!(cb.state(), CircuitState::HalfOpen);

    fail(&cb).await;
    assert_eq!(cb.state(), CircuitState::Open);
    assert_eq!(cb.recorder().counter_value("opened_total"), 2);

    // The open timer restarted at the reopen.
    tokio::time::advance(Duration::from_secs(15)).await;
    assert!(fail(&cb).await.is_rejection());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_failures_open_exactly_once() {
    let cb = std::sync::Arc::new(breaker());
    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let cb = std::sync::Arc::clone(&cb);
            tokio::spawn(async move {
                let _ = cb
                    .execute(|| async {
                        tokio::task::yield_now().await;
                        Err::<(), _>(std::io::Error::other("boom"))
                    })
                    .await;
            })
        })
        .collect();
    futures::future::join_all(tasks).await;

    assert_eq!(cb.state(), CircuitState::Open);
    assert_eq!(cb.recorder().counter_value("opened_total"), 1);
    let stats = cb.stats();
    assert_eq!(stats.requests, 20);
    assert_eq!(stats.failures + stats.rejections, 20);
}
