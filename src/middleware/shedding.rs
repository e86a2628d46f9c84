use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use http::StatusCode;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

use super::{HttpRequest, HttpResponse, Middleware, Next};
use crate::shedding::{LoadShedder, RequestContext, ShedDecision, SheddingLevel};

pub const LOAD_SHEDDING_HEADER: HeaderName = HeaderName::from_static("x-load-shedding");
pub const SHEDDING_LEVEL_HEADER: HeaderName = HeaderName::from_static("x-shedding-level");
pub const SHEDDING_RATE_HEADER: HeaderName = HeaderName::from_static("x-shedding-rate");

/// Rejects requests the [`LoadShedder`] chooses to shed and feeds latency and
/// in-flight counts of admitted requests back into its sampler.
///
/// Every response carries `X-Load-Shedding`, `X-Shedding-Level` and
/// `X-Shedding-Rate`.
pub struct LoadSheddingMiddleware {
    shedder: Arc<LoadShedder>,
    status: StatusCode,
    body: Option<Bytes>,
    headers: HeaderMap,
}

impl LoadSheddingMiddleware {
    pub fn new(shedder: Arc<LoadShedder>) -> Self {
        Self {
            shedder,
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Fixed body for shed responses instead of the default JSON document.
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Extra header added to shed responses.
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn shedder(&self) -> &Arc<LoadShedder> {
        &self.shedder
    }

    fn shed_response(&self, level: SheddingLevel, rate: f64) -> HttpResponse {
        let mut resp = match &self.body {
            Some(body) => {
                let mut resp = http::Response::new(body.clone());
                *resp.status_mut() = self.status;
                resp
            }
            None => super::json_response(
                self.status,
                &serde_json::json!({
                    "error": "service overloaded",
                    "reason": "load_shedding",
                    "level": level.as_str(),
                    "shed_rate": rate,
                }),
            ),
        };
        let headers = resp.headers_mut();
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
        if self.body.is_some() && !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        }
        resp
    }
}

fn annotate(resp: &mut HttpResponse, decision: &ShedDecision) {
    let headers = resp.headers_mut();
    headers.insert(
        LOAD_SHEDDING_HEADER,
        HeaderValue::from_static(if decision.shed { "true" } else { "false" }),
    );
    headers.insert(
        SHEDDING_LEVEL_HEADER,
        HeaderValue::from_static(decision.level.as_str()),
    );
    if let Ok(v) = HeaderValue::from_str(&format!("{:.2}", decision.rate)) {
        headers.insert(SHEDDING_RATE_HEADER, v);
    }
}

#[async_trait]
impl Middleware for LoadSheddingMiddleware {
    async fn process(&self, req: HttpRequest, next: Next<'_>) -> HttpResponse {
        let ctx = RequestContext::from_request(&req);
        let decision = self.shedder.should_shed_detailed(&ctx);
        if decision.shed {
            debug!(
                shedder = %self.shedder.name(),
                method = %ctx.method,
                path = %ctx.path,
                level = %decision.level,
                "request shed"
            );
            let mut resp = self.shed_response(decision.level, decision.rate);
            annotate(&mut resp, &decision);
            return resp;
        }

        let sampler = self.shedder.sampler();
        let inflight = sampler.begin_request();
        let started = Instant::now();
        let mut resp = next.run(req).await;
        sampler.record_response(started.elapsed());
        drop(inflight);

        annotate(&mut resp, &decision);
        resp
    }

    fn name(&self) -> &str {
        "load_shedding"
    }
}
