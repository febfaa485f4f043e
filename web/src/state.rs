//! Application state for the monitoring API.

use chronicle_core::statistics::EventLogQueries;
use chronicle_projections::ProjectionCoordinator;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Shared state of every handler. Cloned per request (only `Arc`s inside).
#[derive(Clone)]
pub struct AppState {
    /// Projection coordinator: overview, rebuilds and failure resolution.
    pub coordinator: Arc<ProjectionCoordinator>,
    /// Statistics and recent-events queries over the log.
    pub events: Arc<dyn EventLogQueries>,
    /// Prometheus recorder handle; `/metrics` answers 404 without it.
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Create the state.
    #[must_use]
    pub fn new(coordinator: Arc<ProjectionCoordinator>, events: Arc<dyn EventLogQueries>) -> Self {
        Self {
            coordinator,
            events,
            metrics: None,
        }
    }

    /// Serve `handle` on `/metrics`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}
