use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::HttpBody;
use axum::extract::Request;
use axum::http::HeaderMap;
use axum::http::header::CONTENT_LENGTH;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use taskmine_core::routing::RouterDecision;
use taskmine_core::trace::{ExtractedMetrics, TraceRecord, TraceStore};
use tower::{Layer, Service, ServiceExt};

pub const SESSION_HEADER: &str = "x-session-id";
pub const USER_HEADER: &str = "x-user-id";

/// Request details a handler knows and the middleware does not. Handlers
/// return it as a response extension; the middleware merges it into the
/// trace record.
#[derive(Debug, Clone, Default)]
pub struct TraceAnnotation {
    pub dataset: Option<String>,
    pub intent: Option<String>,
    pub filters: Option<serde_json::Value>,
    pub model: Option<String>,
    pub tokens_prompt: Option<u64>,
    pub tokens_completion: Option<u64>,
    pub latency_ms_model: Option<f64>,
    pub extracted_metrics: Option<ExtractedMetrics>,
    pub router: Option<RouterDecision>,
    pub session_id: Option<String>,
    pub user_id: Option<String>,
    pub resolved: bool,
    pub error: Option<String>,
}

impl TraceAnnotation {
    pub fn for_dataset(dataset: &str, intent: &str) -> Self {
        Self {
            dataset: Some(dataset.to_string()),
            intent: Some(intent.to_string()),
            ..Self::default()
        }
    }

    fn apply(self, record: &mut TraceRecord) {
        record.dataset = self.dataset.or(record.dataset.take());
        record.intent = self.intent.or(record.intent.take());
        if let Some(filters) = self.filters {
            record.filters = filters;
        }
        record.model = self.model;
        record.tokens_prompt = self.tokens_prompt;
        record.tokens_completion = self.tokens_completion;
        record.latency_ms_model = self.latency_ms_model;
        record.extracted_metrics = self.extracted_metrics;
        if let Some(router) = self.router {
            record.set_router(Some(router.selected), router.should_have_selected);
        }
        // Body-supplied ids win over headers.
        if self.session_id.is_some() {
            record.session_id = self.session_id;
        }
        if self.user_id.is_some() {
            record.user_id = self.user_id;
        }
        record.resolved = self.resolved;
        if self.error.is_some() {
            record.error = self.error;
        }
    }
}

/// Tower Layer that writes one trace record per `/api/` request.
///
/// Measures wall-clock latency and payload sizes, reads session/user ids
/// from headers and merges the handler's [`TraceAnnotation`]. The append
/// runs on the blocking pool and never changes the response.
#[derive(Clone)]
pub struct TraceLogLayer {
    store: TraceStore,
    enabled: bool,
}

impl TraceLogLayer {
    pub fn new(store: TraceStore, enabled: bool) -> Self {
        Self { store, enabled }
    }
}

impl<S> Layer<S> for TraceLogLayer {
    type Service = TraceLogService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TraceLogService {
            inner,
            store: self.store.clone(),
            enabled: self.enabled,
        }
    }
}

#[derive(Clone)]
pub struct TraceLogService<S> {
    inner: S,
    store: TraceStore,
    enabled: bool,
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl<S> Service<Request> for TraceLogService<S>
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let not_ready = self.inner.clone();
        let ready = std::mem::replace(&mut self.inner, not_ready);
        let store = self.store.clone();
        let enabled = self.enabled;

        Box::pin(async move {
            let path = req.uri().path().to_owned();

            if !enabled || !path.starts_with("/api/") {
                return Ok(ready.oneshot(req).await.into_response());
            }

            let mut record = TraceRecord::new(path, Utc::now());
            let start = Instant::now();
            record.request_bytes = header_value(req.headers(), CONTENT_LENGTH.as_str())
                .and_then(|v| v.parse().ok());
            record.session_id = header_value(req.headers(), SESSION_HEADER);
            record.user_id = header_value(req.headers(), USER_HEADER);

            let response = ready.oneshot(req).await.into_response();

            record.latency_ms_total = Some(start.elapsed().as_secs_f64() * 1000.0);
            record.status_code = Some(response.status().as_u16());
            record.response_bytes = response.body().size_hint().exact();
            if let Some(annotation) = response.extensions().get::<TraceAnnotation>() {
                annotation.clone().apply(&mut record);
            }
            if record.error.is_none() && !response.status().is_success() {
                record.error = Some(format!("HTTP {}", response.status().as_u16()));
            }

            match tokio::task::spawn_blocking(move || store.append(&record)).await {
                Ok(()) => {}
                Err(e) => tracing::warn!(error = %e, "Trace append task failed"),
            }

            Ok(response)
        })
    }
}
