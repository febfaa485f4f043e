//! Per-projector engine: one projector bound to its durable state.
//!
//! The engine pairs a [`Projector`] with the [`ProjectionRegistry`] so the
//! coordinator can treat "apply an event" and "read or move the checkpoint"
//! as operations on one projection.

use chronicle_core::event::{GlobalSequence, RecordedEvent};
use chronicle_core::lease::Lease;
use chronicle_core::projection::{
    ProjectionError, ProjectionRegistry, ProjectionState, ProjectionUpdate, Projector, Result,
};
use std::sync::Arc;

/// A projector plus access to its checkpoint and status.
#[derive(Clone)]
pub struct ProjectionEngine {
    projector: Arc<dyn Projector>,
    registry: Arc<dyn ProjectionRegistry>,
}

impl ProjectionEngine {
    /// Bind `projector` to `registry`.
    #[must_use]
    pub fn new(projector: Arc<dyn Projector>, registry: Arc<dyn ProjectionRegistry>) -> Self {
        Self {
            projector,
            registry,
        }
    }

    /// Projection name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.projector.name()
    }

    /// Prepare the read model and register the projection.
    ///
    /// Idempotent: an already registered projection keeps its checkpoint.
    ///
    /// # Errors
    ///
    /// Returns the projector's or the registry's error.
    pub async fn initialize(&self) -> Result<ProjectionState> {
        self.projector.initialize().await?;
        let state = self.registry.register(self.name()).await?;
        tracing::info!(
            projection = self.name(),
            checkpoint = state.checkpoint.value(),
            status = %state.status,
            "Projection initialized"
        );
        Ok(state)
    }

    /// Apply one event to the read model.
    ///
    /// # Errors
    ///
    /// Returns the projector's error unchanged.
    pub async fn apply(&self, event: &RecordedEvent) -> Result<()> {
        self.projector.apply(event).await
    }

    /// Clear the read model.
    ///
    /// # Errors
    ///
    /// Returns the projector's error unchanged.
    pub async fn reset(&self) -> Result<()> {
        self.projector.reset().await
    }

    /// Current durable state.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::NotFound`] if the projection was never
    /// initialized, or the registry's error.
    pub async fn state(&self) -> Result<ProjectionState> {
        self.registry
            .load(self.name())
            .await?
            .ok_or_else(|| ProjectionError::NotFound(self.name().to_string()))
    }

    /// Last committed global sequence.
    ///
    /// # Errors
    ///
    /// See [`ProjectionEngine::state`].
    pub async fn checkpoint(&self) -> Result<GlobalSequence> {
        Ok(self.state().await?.checkpoint)
    }

    /// Commit a state change under `lease`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::LeaseLost`] if the lease is no longer held.
    pub async fn commit(&self, lease: &Lease, update: ProjectionUpdate) -> Result<ProjectionState> {
        self.registry.commit(lease, update).await
    }
}

impl std::fmt::Debug for ProjectionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionEngine")
            .field("projection", &self.name())
            .finish_non_exhaustive()
    }
}
