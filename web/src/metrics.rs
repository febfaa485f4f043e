//! Prometheus exporter setup.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `chronicle.events.appended{stream_type}` - Events appended
//! - `chronicle.append.conflicts` - Appends rejected for a stale expected version
//! - `chronicle.projection.events_applied{projection}` - Events applied by projections
//! - `chronicle.projection.apply_failures{projection}` - Failed applies
//! - `chronicle.projection.rebuilds_started` / `rebuilds_completed`
//! - `chronicle.failures.recorded` / `chronicle.failures.resolved`
//! - `chronicle.http.requests{endpoint,method,status}`
//!
//! ## Gauges
//! - `chronicle.projection.lag{projection}` - Events behind the head
//!
//! ## Histograms
//! - `chronicle.append.duration`, `chronicle.projection.tick.duration`,
//!   `chronicle.http.request.duration` (seconds)

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

/// Errors from metrics setup.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Install the Prometheus recorder and describe every metric.
///
/// The returned handle renders the text exposition served on `/metrics`.
///
/// # Errors
///
/// Returns [`MetricsError::Install`] if a recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, MetricsError> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("duration".to_string()),
            &[
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
        )
        .map_err(|e| MetricsError::Build(e.to_string()))?
        .install_recorder()
        .map_err(|e| MetricsError::Install(e.to_string()))?;

    register_metrics();
    tracing::info!("Metrics recorder installed");
    Ok(handle)
}

fn register_metrics() {
    // Event store
    describe_counter!("chronicle.events.appended", "Events appended to the store");
    describe_counter!(
        "chronicle.append.conflicts",
        "Appends rejected because the expected version was stale"
    );
    describe_histogram!("chronicle.append.duration", "Time taken to append events");

    // Projections
    describe_counter!(
        "chronicle.projection.events_applied",
        "Events applied by projections"
    );
    describe_counter!(
        "chronicle.projection.apply_failures",
        "Events a projection failed to apply"
    );
    describe_counter!("chronicle.projection.rebuilds_started", "Rebuilds started");
    describe_counter!("chronicle.projection.rebuilds_completed", "Rebuilds completed");
    describe_gauge!(
        "chronicle.projection.lag",
        "Events between the head and a projection's checkpoint"
    );
    describe_histogram!("chronicle.projection.tick.duration", "Time taken by one tick");

    // Failure ledger
    describe_counter!("chronicle.failures.recorded", "Failures recorded");
    describe_counter!("chronicle.failures.resolved", "Failures resolved by an operator");

    // HTTP
    describe_counter!("chronicle.http.requests", "HTTP requests served");
    describe_histogram!(
        "chronicle.http.request.duration",
        "Time taken to serve HTTP requests"
    );
}
