use async_trait::async_trait;
use http::header::{HeaderValue, CONNECTION};
use std::sync::Arc;

use super::{HttpRequest, HttpResponse, Middleware, Next};
use crate::draining::{ConnectionId, ConnectionTracker};

/// Reports request activity to a [`ConnectionTracker`].
///
/// The server stores the connection's [`ConnectionId`] as a request
/// extension. While a drain is running responses carry `Connection: close`.
pub struct ConnectionActivityMiddleware {
    tracker: Arc<ConnectionTracker>,
}

impl ConnectionActivityMiddleware {
    pub fn new(tracker: Arc<ConnectionTracker>) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl Middleware for ConnectionActivityMiddleware {
    async fn process(&self, req: HttpRequest, next: Next<'_>) -> HttpResponse {
        let id = req.extensions().get::<ConnectionId>().copied();
        let mut resp = next.run(req).await;
        if let Some(id) = id {
            self.tracker.update_activity(id);
        }
        if self.tracker.is_draining() {
            resp.headers_mut()
                .insert(CONNECTION, HeaderValue::from_static("close"));
        }
        resp
    }

    fn name(&self) -> &str {
        "connection_activity"
    }
}
