//! Projection coordination for Chronicle.
//!
//! # Overview
//!
//! This crate turns the global event log into read models:
//! - **`ProjectionCoordinator`**: bounded, leased ticks over the log, failure
//!   recording, rebuilds and operator resolutions
//! - **`ProjectionWorker` / `WorkerPool`**: one background task per projection
//! - **Built-in projectors**: event type counts and stream activity
//! - **`PostgreSQL`**: read-model storage and the projection registry
//!
//! # CQRS Separation
//!
//! Projections read the log through `EventStore::read_all` and keep their
//! state in their own tables, which may live in a separate database:
//!
//! ```text
//! Event Store DB (Write)  →  read_all(checkpoint)  →  Projection DB (Read)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use chronicle_projections::{CoordinatorConfig, ProjectionCoordinator, WorkerPool};
//!
//! let coordinator = Arc::new(
//!     ProjectionCoordinator::new(store.clone(), store, registry, ledger, CoordinatorConfig::default())
//!         .with_projector(Arc::new(EventTypeCountsProjector::new(projection_store))),
//! );
//! coordinator.initialize().await?;
//!
//! let (workers, shutdown) = WorkerPool::spawn(Arc::clone(&coordinator))?;
//! // ...
//! shutdown.send(true)?;
//! workers.join().await;
//! ```

pub mod coordinator;
pub mod engine;
pub mod postgres;
pub mod projectors;
pub mod retry;
pub mod worker;

// Re-export main types for convenience
pub use coordinator::{
    CoordinatorConfig, CoordinatorError, Overview, ProjectionCoordinator, ProjectionHealth,
    ProjectionOverview, REBUILD_INCOMPLETE, RebuildTicket, TickReport,
};
pub use engine::ProjectionEngine;
pub use postgres::{PostgresProjectionRegistry, PostgresProjectionStore};
pub use projectors::{EventTypeCountsProjector, StreamActivityProjector};
pub use retry::{RetryPolicy, retry_with_predicate};
pub use worker::{ProjectionWorker, WorkerPool};
