//! Router configuration.

use crate::handlers::{health, monitoring};
use crate::middleware::{propagate_correlation_id, record_http_metrics};
use crate::state::AppState;
use axum::{
    Router,
    middleware::from_fn,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

/// Prefix of the monitoring API.
pub const MONITORING_PREFIX: &str = "/api/monitoring";

/// Build the complete router.
///
/// - `/health`, `/ready`, `/metrics`
/// - the monitoring API under [`MONITORING_PREFIX`]
pub fn build_router(state: AppState) -> Router {
    let monitoring_routes = Router::new()
        .route("/overview", get(monitoring::overview))
        .route("/statistics", get(monitoring::statistics))
        .route("/recent-events", get(monitoring::recent_events))
        .route("/projections", get(monitoring::projections))
        .route("/projections/:name", get(monitoring::projection))
        .route(
            "/projections/:name/rebuild",
            post(monitoring::rebuild_projection),
        )
        .route("/failures", get(monitoring::list_failures))
        .route("/failures/:id", get(monitoring::get_failure))
        .route("/failures/:id/resolve", post(monitoring::resolve_failure));

    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::metrics))
        .nest(MONITORING_PREFIX, monitoring_routes)
        .layer(from_fn(record_http_metrics))
        .layer(from_fn(propagate_correlation_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
