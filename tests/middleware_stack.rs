//! Full middleware stack: activity -> shedding -> breaker -> handler

mod common;

use bytes::Bytes;
use http::StatusCode;
use resilience_kit::draining::{Connection, ConnectionHandle, ConnectionTracker, DrainConfig};
use resilience_kit::middleware::{
    handler_fn, CircuitBreakerMiddleware, ConnectionActivityMiddleware, Handler,
    LoadSheddingMiddleware, MiddlewareChain, Service,
};
use resilience_kit::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use resilience_kit::sampler::{ManualProbe, SystemSampler};
use resilience_kit::shedding::{LoadShedder, LoadShedderConfig, SheddingLevel};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

struct Stack {
    shedder: Arc<LoadShedder>,
    breaker: Arc<CircuitBreaker>,
    tracker: Arc<ConnectionTracker>,
    fail: Arc<AtomicBool>,
    hits: Arc<AtomicUsize>,
    service: Service,
}

fn stack() -> Stack {
    common::init_tracing();
    let sampler = Arc::new(SystemSampler::new(Arc::new(ManualProbe::new(0.0, 0.0))));
    let shedder =
        Arc::new(LoadShedder::new("edge", LoadShedderConfig::default(), sampler).unwrap());
    let breaker = Arc::new(
        CircuitBreaker::new("backend", CircuitBreakerConfig::new().with_failure_threshold(2))
            .unwrap(),
    );
    let tracker = Arc::new(ConnectionTracker::new("http", DrainConfig::default()).unwrap());
    let fail = Arc::new(AtomicBool::new(false));
    let hits = Arc::new(AtomicUsize::new(0));

    let endpoint = {
        let fail = Arc::clone(&fail);
        let hits = Arc::clone(&hits);
        handler_fn(move |_req| {
            let fail = fail.load(Ordering::SeqCst);
            hits.fetch_add(1, Ordering::SeqCst);
            async move {
                let mut resp = http::Response::new(Bytes::from_static(b"payload"));
                if fail {
                    *resp.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                }
                resp
            }
        })
    };

    let service = MiddlewareChain::new()
        .add(Arc::new(ConnectionActivityMiddleware::new(Arc::clone(&tracker))))
        .add(Arc::new(LoadSheddingMiddleware::new(Arc::clone(&shedder))))
        .add(Arc::new(CircuitBreakerMiddleware::new(Arc::clone(&breaker))))
        .service(Arc::new(endpoint));

    Stack {
        shedder,
        breaker,
        tracker,
        fail,
        hits,
        service,
    }
}

fn request(conn: &ConnectionHandle) -> http::Request<Bytes> {
    let mut req = http::Request::builder()
        .method("POST")
        .uri("/checkout")
        .body(Bytes::from_static(b"{}"))
        .unwrap();
    req.extensions_mut().insert(conn.id());
    req
}

#[tokio::test]
async fn test_healthy_request_passes_every_layer() {
    let s = stack();
    let conn = Arc::new(ConnectionHandle::new());
    s.tracker.track_connection(conn.clone());

    let resp = s.service.call(request(&conn)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.body().as_ref(), b"payload");
    assert_eq!(resp.headers()["x-load-shedding"], "false");
    assert_eq!(resp.headers()["x-circuit-breaker"], "closed");
    assert_eq!(s.tracker.connection_info(conn.id()).unwrap().requests, 1);
    assert_eq!(s.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shed_requests_never_reach_breaker() {
    let s = stack();
    let conn = Arc::new(ConnectionHandle::new());
    s.shedder.force_level(SheddingLevel::Critical);

    let resp = s.service.call(request(&conn)).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(resp.headers()["x-load-shedding"], "true");
    assert!(resp.headers().get("x-circuit-breaker").is_none());
    assert_eq!(s.breaker.stats().requests, 0);
    assert_eq!(s.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_backend_errors_trip_breaker() {
    let s = stack();
    let conn = Arc::new(ConnectionHandle::new());
    s.fail.store(true, Ordering::SeqCst);

    for _ in 0..2 {
        let resp = s.service.call(request(&conn)).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
    assert_eq!(s.breaker.state(), CircuitState::Open);

    s.fail.store(false, Ordering::SeqCst);
    let resp = s.service.call(request(&conn)).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(resp.headers()["x-circuit-breaker"], "open");
    // The shedding layer still annotates breaker rejections.
    assert_eq!(resp.headers()["x-load-shedding"], "false");
    assert_eq!(s.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_draining_marks_responses_connection_close() {
    let s = stack();
    let conn = Arc::new(ConnectionHandle::new());
    s.tracker.track_connection(conn.clone());
    s.tracker.start_draining().unwrap();

    let resp = s.service.call(request(&conn)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["connection"], "close");
    assert!(conn.deadline().is_some());
    s.tracker.reset().await;
}
