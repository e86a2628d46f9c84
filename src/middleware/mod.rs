//! HTTP middleware adapters for the guards.
//!
//! Middlewares wrap a [`Handler`] over `http::Request<Bytes>` /
//! `http::Response<Bytes>`, so they slot in front of any server that can
//! buffer bodies.
//!
//! ```rust
//! use bytes::Bytes;
//! use resilience_kit::middleware::{handler_fn, MiddlewareChain};
//! use std::sync::Arc;
//!
//! # async fn run(shedding: Arc<dyn resilience_kit::middleware::Middleware>) {
//! let chain = MiddlewareChain::new().add(shedding);
//! let endpoint = handler_fn(|_req| async { http::Response::new(Bytes::from_static(b"ok")) });
//!
//! let resp = chain.execute(http::Request::new(Bytes::new()), &endpoint).await;
//! # let _ = resp;
//! # }
//! ```

pub mod activity;
pub mod breaker;
pub mod shedding;

pub use activity::ConnectionActivityMiddleware;
pub use breaker::CircuitBreakerMiddleware;
pub use shedding::LoadSheddingMiddleware;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use std::future::Future;
use std::sync::Arc;

pub type HttpRequest = http::Request<Bytes>;
pub type HttpResponse = http::Response<Bytes>;

/// Terminal request handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, req: HttpRequest) -> HttpResponse;
}

/// Handler backed by an async closure. See [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(HttpRequest) -> Fut + Send + Sync,
    Fut: Future<Output = HttpResponse> + Send,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(HttpRequest) -> Fut + Send + Sync,
    Fut: Future<Output = HttpResponse> + Send,
{
    async fn call(&self, req: HttpRequest) -> HttpResponse {
        (self.f)(req).await
    }
}

/// The rest of the chain after the current middleware.
pub struct Next<'a> {
    middlewares: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Handler,
}

impl<'a> Next<'a> {
    pub async fn run(self, req: HttpRequest) -> HttpResponse {
        match self.middlewares.split_first() {
            Some((current, rest)) => {
                let next = Next {
                    middlewares: rest,
                    endpoint: self.endpoint,
                };
                current.process(req, next).await
            }
            None => self.endpoint.call(req).await,
        }
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn process(&self, req: HttpRequest, next: Next<'_>) -> HttpResponse;
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Ordered middlewares; the first added sees the request first.
#[derive(Clone, Default)]
pub struct MiddlewareChain {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, m: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(m);
        self
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    pub async fn execute(&self, req: HttpRequest, endpoint: &dyn Handler) -> HttpResponse {
        Next {
            middlewares: &self.middlewares,
            endpoint,
        }
        .run(req)
        .await
    }

    /// Bind the chain to an endpoint, producing a single [`Handler`].
    pub fn service(self, endpoint: Arc<dyn Handler>) -> Service {
        Service {
            chain: self,
            endpoint,
        }
    }
}

/// A chain bound to its endpoint.
#[derive(Clone)]
pub struct Service {
    chain: MiddlewareChain,
    endpoint: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for Service {
    async fn call(&self, req: HttpRequest) -> HttpResponse {
        self.chain.execute(req, self.endpoint.as_ref()).await
    }
}

pub(crate) fn json_response(status: StatusCode, body: &serde_json::Value) -> HttpResponse {
    let mut resp = http::Response::new(Bytes::from(body.to_string()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}
