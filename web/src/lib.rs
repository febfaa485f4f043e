//! Monitoring API for Chronicle.
//!
//! An Axum router over the projection coordinator and the event log queries:
//!
//! ```text
//! GET  /api/monitoring/overview
//! GET  /api/monitoring/statistics?bucket=&since=&until=
//! GET  /api/monitoring/recent-events?event_type=&stream_type=&before=&limit=
//! GET  /api/monitoring/projections
//! GET  /api/monitoring/projections/{name}
//! POST /api/monitoring/projections/{name}/rebuild
//! GET  /api/monitoring/failures?projection=&resolved=&limit=
//! GET  /api/monitoring/failures/{id}
//! POST /api/monitoring/failures/{id}/resolve
//! GET  /health | /ready | /metrics
//! ```
//!
//! The `chronicle-server` binary wires the Postgres stores, the projection
//! workers and this router together.
//!
//! # Example
//!
//! ```ignore
//! use chronicle_web::{AppState, build_router};
//!
//! let state = AppState::new(coordinator, Arc::new(store));
//! let app = build_router(state);
//! axum::serve(listener, app).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::AppError;
pub use middleware::{CORRELATION_ID_HEADER, CorrelationId, CorrelationIdExt};
pub use routes::{MONITORING_PREFIX, build_router};
pub use state::AppState;

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
