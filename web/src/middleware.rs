//! Request middleware: correlation IDs and HTTP metrics.
//!
//! Both are plain `async fn(Request, Next) -> Response` functions mounted with
//! [`axum::middleware::from_fn`]:
//!
//! ```ignore
//! use axum::middleware::from_fn;
//! use chronicle_web::middleware::{propagate_correlation_id, record_http_metrics};
//!
//! let app = Router::new()
//!     .route("/api/monitoring/overview", get(overview))
//!     .layer(from_fn(record_http_metrics))
//!     .layer(from_fn(propagate_correlation_id));
//! ```
//!
//! A request's correlation ID is taken from `X-Correlation-ID` when it holds a
//! UUID, otherwise generated. It is stored in the request extensions, attached
//! to the request span and echoed on the response.

use axum::{
    extract::{MatchedPath, Request},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

/// Header carrying the correlation ID in both directions.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// Requests slower than this are logged at warn.
const SLOW_REQUEST_SECS: f64 = 1.0;

/// Correlation ID of one request, stored in the request extensions.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    fn from_request(req: &Request) -> Self {
        let id = req
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| Uuid::parse_str(value).ok())
            .unwrap_or_else(Uuid::new_v4);
        Self(id)
    }
}

/// Accept or generate the correlation ID and run the request inside a span
/// carrying it.
pub async fn propagate_correlation_id(mut req: Request, next: Next) -> Response {
    let id = CorrelationId::from_request(&req);
    req.extensions_mut().insert(id);

    let span = tracing::info_span!(
        "http_request",
        correlation_id = %id.0,
        method = %req.method(),
        uri = %req.uri(),
    );
    let mut response = next.run(req).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&id.0.to_string()) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}

/// Count requests and record their latency, labelled by route template.
pub async fn record_http_metrics(req: Request, next: Next) -> Response {
    let started = Instant::now();
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |path| path.as_str().to_string());
    let method = req.method().to_string();

    let response = next.run(req).await;

    let elapsed = started.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();
    metrics::counter!(
        "chronicle.http.requests",
        "endpoint" => endpoint.clone(),
        "method" => method.clone(),
        "status" => status.clone()
    )
    .increment(1);
    metrics::histogram!("chronicle.http.request.duration", "endpoint" => endpoint.clone())
        .record(elapsed);

    if elapsed > SLOW_REQUEST_SECS {
        tracing::warn!(
            endpoint = %endpoint,
            method = %method,
            status = %status,
            duration_secs = elapsed,
            "Slow request"
        );
    }
    response
}

/// Read the correlation ID stored by [`propagate_correlation_id`].
pub trait CorrelationIdExt {
    /// The correlation ID, or `None` if the middleware is not mounted.
    fn correlation_id(&self) -> Option<Uuid>;
}

impl CorrelationIdExt for Request {
    fn correlation_id(&self) -> Option<Uuid> {
        self.extensions().get::<CorrelationId>().map(|id| id.0)
    }
}
