//! Projection system for building and maintaining read models from the log.
//!
//! # Overview
//!
//! Projections are the **query side** of the system: each one consumes the
//! global log in order and maintains its own read model.
//!
//! ## Key Concepts
//!
//! - **Projector**: transforms recorded events into read-model writes
//! - **Projection Store**: key/value storage for read-model data
//! - **Checkpoint**: last global sequence a projection applied successfully
//! - **Projection Registry**: durable projection state (checkpoint, status,
//!   last error, rebuild target) plus the lease that fences writers
//!
//! ```text
//!  Event Store (global log)          Projections
//! ┌───────────────────────┐        ┌─────────────────────────┐
//! │ 1 2 3 4 5 ... head    │ ─────▶ │ ticket_stats   @ 5      │
//! └───────────────────────┘        │ stream_activity @ head  │
//!                                  └─────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use chronicle_core::projection::*;
//!
//! struct SeatCountProjector<S: ProjectionStore> {
//!     store: S,
//! }
//!
//! impl<S: ProjectionStore> Projector for SeatCountProjector<S> {
//!     fn name(&self) -> &str {
//!         "seat_counts"
//!     }
//!
//!     fn apply<'a>(&'a self, event: &'a RecordedEvent) -> BoxFuture<'a, Result<()>> {
//!         Box::pin(async move {
//!             if event.event_type == "TicketReserved.v1" {
//!                 self.store.save(&format!("seat:{}", event.stream_id), &event.payload).await?;
//!             }
//!             Ok(())
//!         })
//!     }
//!
//!     fn reset(&self) -> BoxFuture<'_, Result<()>> {
//!         Box::pin(async move { self.store.clear_prefix("seat:").await.map(|_| ()) })
//!     }
//! }
//! ```

use crate::BoxFuture;
use crate::event::{GlobalSequence, RecordedEvent};
use crate::lease::{Lease, LeaseOwner};
use crate::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

/// Error type for projection operations.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Checkpoint error
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// Event processing error raised by a projector's `apply`.
    ///
    /// Confined to the projection that raised it.
    #[error("Event processing error: {0}")]
    EventProcessing(String),

    /// The caller's lease expired or was taken over; the write was rejected.
    #[error("Lease lost for projection {projection}")]
    LeaseLost {
        /// Projection whose lease was lost.
        projection: String,
    },

    /// The named projection or record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Generic error
    #[error("Projection error: {0}")]
    Other(String),
}

impl ProjectionError {
    /// Whether the error comes from unreachable storage and may clear up.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Checkpoint(_))
    }
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;

/// Lifecycle status of a projection.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionStatus {
    /// Consuming the log normally.
    #[default]
    Running,
    /// Replaying from the start of the log towards a rebuild target.
    Rebuilding,
    /// Blocked on an event its projector could not apply.
    Failed,
}

impl ProjectionStatus {
    /// Stored and serialized name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Rebuilding => "rebuilding",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ProjectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProjectionStatus {
    type Err = ProjectionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "rebuilding" => Ok(Self::Rebuilding),
            "failed" => Ok(Self::Failed),
            other => Err(ProjectionError::Serialization(format!(
                "unknown projection status '{other}'"
            ))),
        }
    }
}

/// Durable state of one projection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectionState {
    /// Unique projection name.
    pub name: String,
    /// Last global sequence applied (`ZERO` = nothing applied).
    pub checkpoint: GlobalSequence,
    /// Lifecycle status.
    pub status: ProjectionStatus,
    /// Message of the failure currently blocking the projection.
    pub last_error: Option<String>,
    /// Head captured when the current rebuild started.
    pub rebuild_target: Option<GlobalSequence>,
    /// Last time the state changed.
    pub updated_at: DateTime<Utc>,
}

impl ProjectionState {
    /// Fresh state of a newly registered projection.
    #[must_use]
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            checkpoint: GlobalSequence::ZERO,
            status: ProjectionStatus::Running,
            last_error: None,
            rebuild_target: None,
            updated_at: now,
        }
    }

    /// Apply `update` to this state, stamping `updated_at`.
    pub fn apply_update(&mut self, update: &ProjectionUpdate, now: DateTime<Utc>) {
        if let Some(checkpoint) = update.checkpoint {
            self.checkpoint = checkpoint;
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(last_error) = &update.last_error {
            self.last_error.clone_from(last_error);
        }
        if let Some(rebuild_target) = update.rebuild_target {
            self.rebuild_target = rebuild_target;
        }
        self.updated_at = now;
    }

    /// Events between the checkpoint and `head`.
    #[must_use]
    pub const fn lag(&self, head: GlobalSequence) -> u64 {
        head.distance_from(self.checkpoint)
    }
}

/// A partial change to a [`ProjectionState`], committed under a lease.
///
/// Fields left `None` are unchanged.
///
/// # Example
///
/// ```
/// use chronicle_core::event::GlobalSequence;
/// use chronicle_core::projection::{ProjectionStatus, ProjectionUpdate};
///
/// let update = ProjectionUpdate::default()
///     .checkpoint(GlobalSequence::new(10))
///     .with_status(ProjectionStatus::Running)
///     .clear_error();
/// assert_eq!(update.last_error, Some(None));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProjectionUpdate {
    /// New checkpoint.
    pub checkpoint: Option<GlobalSequence>,
    /// New status.
    pub status: Option<ProjectionStatus>,
    /// New last error (`Some(None)` clears it).
    pub last_error: Option<Option<String>>,
    /// New rebuild target (`Some(None)` clears it).
    pub rebuild_target: Option<Option<GlobalSequence>>,
}

impl ProjectionUpdate {
    /// Set the checkpoint.
    #[must_use]
    pub const fn checkpoint(mut self, checkpoint: GlobalSequence) -> Self {
        self.checkpoint = Some(checkpoint);
        self
    }

    /// Set the status.
    #[must_use]
    pub const fn with_status(mut self, status: ProjectionStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Set the last error.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(Some(error.into()));
        self
    }

    /// Clear the last error.
    #[must_use]
    pub fn clear_error(mut self) -> Self {
        self.last_error = Some(None);
        self
    }

    /// Set or clear the rebuild target.
    #[must_use]
    pub const fn rebuild_target(mut self, target: Option<GlobalSequence>) -> Self {
        self.rebuild_target = Some(target);
        self
    }

    /// Whether the update changes nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.checkpoint.is_none()
            && self.status.is_none()
            && self.last_error.is_none()
            && self.rebuild_target.is_none()
    }
}

/// A projector turns recorded events into read-model writes.
///
/// `apply` must only touch the projector's own read model and must tolerate
/// at-least-once delivery: after a crash between a read-model write and the
/// checkpoint commit, the same event is delivered again.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so coordinators can hold
/// `Arc<dyn Projector>` for heterogeneous projectors.
pub trait Projector: Send + Sync {
    /// Unique projection name (e.g., `"ticket_stats"`).
    fn name(&self) -> &str;

    /// Prepare read-model storage. Called once before the first tick.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if setup fails.
    fn initialize(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    /// Apply one event to the read model.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::EventProcessing`] for events the projector
    /// cannot handle, or a storage error.
    fn apply<'a>(&'a self, event: &'a RecordedEvent) -> BoxFuture<'a, Result<()>>;

    /// Delete all read-model data, ahead of a replay from the start.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if clearing fails.
    fn reset(&self) -> BoxFuture<'_, Result<()>>;
}

/// Storage backend for projection data.
///
/// Projections can use different storage from the event store, optimized
/// for query patterns.
///
/// # Example
///
/// ```ignore
/// // Simple key-value storage
/// let store = PostgresProjectionStore::new(pool, "projection_data");
/// store.save("event_type:TicketReserved.v1", &count.to_be_bytes()).await?;
/// let data = store.get("event_type:TicketReserved.v1").await?;
/// ```
pub trait ProjectionStore: Send + Sync {
    /// Save projection data to storage.
    ///
    /// Implementations should handle upserts (insert or update).
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if save fails.
    fn save(&self, key: &str, data: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Get projection data by key.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if retrieval fails.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Vec<u8>>>> + Send;

    /// Delete projection data by key.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if deletion fails.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Delete every key starting with `prefix`, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if deletion fails.
    fn clear_prefix(&self, prefix: &str) -> impl Future<Output = Result<u64>> + Send;

    /// List `(key, data)` pairs whose key starts with `prefix`, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if retrieval fails.
    fn scan_prefix(
        &self,
        prefix: &str,
    ) -> impl Future<Output = Result<Vec<(String, Vec<u8>)>>> + Send;

    /// Check if projection data exists.
    ///
    /// Default implementation uses [`ProjectionStore::get`].
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if check fails.
    fn exists(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        async move { Ok(self.get(key).await?.is_some()) }
    }
}

/// Durable projection state and lease management.
///
/// Every state change goes through [`ProjectionRegistry::commit`], which is
/// fenced: it succeeds only while the caller's lease is still the current,
/// unexpired lease of the projection.
///
/// # Dyn Compatibility
///
/// This trait uses explicit boxed futures so the coordinator can hold an
/// `Arc<dyn ProjectionRegistry>`.
pub trait ProjectionRegistry: Send + Sync {
    /// Register a projection, creating it at checkpoint 0 if absent.
    ///
    /// Returns the current state. Registering twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] on storage failure.
    fn register(&self, name: &str) -> BoxFuture<'_, Result<ProjectionState>>;

    /// Load a projection's state.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] on storage failure.
    fn load(&self, name: &str) -> BoxFuture<'_, Result<Option<ProjectionState>>>;

    /// All registered projections, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] on storage failure.
    fn list(&self) -> BoxFuture<'_, Result<Vec<ProjectionState>>>;

    /// Apply `update` if `lease` is still held, returning the new state.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::LeaseLost`]: the lease expired or another owner
    ///   acquired the projection since
    /// - [`ProjectionError::Checkpoint`]: storage failure
    fn commit<'a>(
        &'a self,
        lease: &'a Lease,
        update: ProjectionUpdate,
    ) -> BoxFuture<'a, Result<ProjectionState>>;

    /// Acquire the lease if nobody holds it or the holder's lease expired.
    ///
    /// Returns `None` when another owner holds an unexpired lease. A
    /// successful acquisition always yields a token greater than any earlier
    /// token of the projection.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::NotFound`]: the projection is not registered
    /// - [`ProjectionError::Checkpoint`]: storage failure
    fn try_acquire_lease<'a>(
        &'a self,
        name: &'a str,
        owner: &'a LeaseOwner,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<Option<Lease>>>;

    /// Extend a held lease by `ttl` from now.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::LeaseLost`] if the lease is no longer held.
    fn renew_lease<'a>(&'a self, lease: &'a Lease, ttl: Duration) -> BoxFuture<'a, Result<Lease>>;

    /// Release a held lease. Releasing a lost lease is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Checkpoint`] on storage failure.
    fn release_lease<'a>(&'a self, lease: &'a Lease) -> BoxFuture<'a, Result<()>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            ProjectionStatus::Running,
            ProjectionStatus::Rebuilding,
            ProjectionStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ProjectionStatus>().ok(), Some(status));
        }
        assert!("paused".parse::<ProjectionStatus>().is_err());
    }

    #[test]
    fn update_only_touches_set_fields() {
        let now = Utc::now();
        let mut state = ProjectionState::new("ticket_stats", now);
        state.last_error = Some("boom".into());

        state.apply_update(
            &ProjectionUpdate::default().checkpoint(GlobalSequence::new(7)),
            now,
        );
        assert_eq!(state.checkpoint, GlobalSequence::new(7));
        assert_eq!(state.last_error.as_deref(), Some("boom"));
        assert_eq!(state.status, ProjectionStatus::Running);

        state.apply_update(
            &ProjectionUpdate::default()
                .with_status(ProjectionStatus::Rebuilding)
                .rebuild_target(Some(GlobalSequence::new(9)))
                .clear_error(),
            now,
        );
        assert_eq!(state.status, ProjectionStatus::Rebuilding);
        assert_eq!(state.rebuild_target, Some(GlobalSequence::new(9)));
        assert_eq!(state.last_error, None);
    }

    #[test]
    fn lag_is_head_minus_checkpoint() {
        let mut state = ProjectionState::new("p", Utc::now());
        state.checkpoint = GlobalSequence::new(10);
        assert_eq!(state.lag(GlobalSequence::new(15)), 5);
        assert_eq!(state.lag(GlobalSequence::new(10)), 0);
        assert!(ProjectionUpdate::default().is_empty());
    }
}
