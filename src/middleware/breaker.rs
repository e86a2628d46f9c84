use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue};
use http::StatusCode;
use std::sync::Arc;
use tracing::debug;

use super::{json_response, HttpRequest, HttpResponse, Middleware, Next};
use crate::resilience::CircuitBreaker;

pub const CIRCUIT_BREAKER_HEADER: HeaderName = HeaderName::from_static("x-circuit-breaker");

/// Gates the downstream handler behind a [`CircuitBreaker`].
///
/// 5xx responses and handler timeouts count as failures; everything else is
/// a success. Rejections answer 503 with `X-Circuit-Breaker: open`.
pub struct CircuitBreakerMiddleware {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerMiddleware {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    async fn process(&self, req: HttpRequest, next: Next<'_>) -> HttpResponse {
        if let Err(err) = self.breaker.allow() {
            debug!(breaker = %self.breaker.name(), error = %err, "request rejected");
            let mut resp = json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                &serde_json::json!({
                    "error": "service unavailable",
                    "reason": "circuit_open",
                    "breaker": self.breaker.name(),
                }),
            );
            resp.headers_mut()
                .insert(CIRCUIT_BREAKER_HEADER, HeaderValue::from_static("open"));
            return resp;
        }

        let timeout = self.breaker.config().call_timeout;
        let mut resp = match tokio::time::timeout(timeout, next.run(req)).await {
            Ok(resp) => {
                if resp.status().is_server_error() {
                    self.breaker.record_failure();
                } else {
                    self.breaker.record_success();
                }
                resp
            }
            Err(_) => {
                self.breaker.record_failure();
                json_response(
                    StatusCode::GATEWAY_TIMEOUT,
                    &serde_json::json!({
                        "error": "upstream timeout",
                        "timeout_ms": timeout.as_millis() as u64,
                    }),
                )
            }
        };
        resp.headers_mut().insert(
            CIRCUIT_BREAKER_HEADER,
            HeaderValue::from_static(self.breaker.state().as_str()),
        );
        resp
    }

    fn name(&self) -> &str {
        "circuit_breaker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{handler_fn, MiddlewareChain};
    use crate::resilience::{CircuitBreakerConfig, CircuitState};
    use bytes::Bytes;
    use std::time::Duration;

    fn status_handler(status: StatusCode) -> impl crate::middleware::Handler {
        handler_fn(move |_req| async move {
            let mut resp = http::Response::new(Bytes::new());
            *resp.status_mut() = status;
            resp
        })
    }

    #[tokio::test]
    async fn test_server_errors_open_the_breaker() {
        let breaker = Arc::new(
            CircuitBreaker::new("upstream", CircuitBreakerConfig::new().with_failure_threshold(2))
                .unwrap(),
        );
        let mw = CircuitBreakerMiddleware::new(Arc::clone(&breaker));
        let chain = MiddlewareChain::new().add(Arc::new(mw));
        let failing = status_handler(StatusCode::BAD_GATEWAY);

        for _ in 0..2 {
            let resp = chain.execute(http::Request::new(Bytes::new()), &failing).await;
            assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let resp = chain
            .execute(http::Request::new(Bytes::new()), &status_handler(StatusCode::OK))
            .await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers()["x-circuit-breaker"], "open");
        assert_eq!(breaker.stats().rejections, 1);
    }

    #[tokio::test]
    async fn test_client_errors_are_successes() {
        let breaker = Arc::new(
            CircuitBreaker::new("upstream", CircuitBreakerConfig::new().with_failure_threshold(1))
                .unwrap(),
        );
        let mw = CircuitBreakerMiddleware::new(Arc::clone(&breaker));
        let chain = MiddlewareChain::new().add(Arc::new(mw));
        let resp = chain
            .execute(http::Request::new(Bytes::new()), &status_handler(StatusCode::NOT_FOUND))
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(resp.headers()["x-circuit-breaker"], "closed");
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_handler_times_out() {
        let breaker = Arc::new(
            CircuitBreaker::new(
                "slow",
                CircuitBreakerConfig::new().with_call_timeout(Duration::from_millis(50)),
            )
            .unwrap(),
        );
        let mw = CircuitBreakerMiddleware::new(Arc::clone(&breaker));
        let chain = MiddlewareChain::new().add(Arc::new(mw));
        let slow = handler_fn(|_req| async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            http::Response::new(Bytes::new())
        });
        let resp = chain.execute(http::Request::new(Bytes::new()), &slow).await;
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(breaker.stats().failures, 1);
    }
}
