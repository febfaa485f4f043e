//! `ProjectionCoordinator`: drives every projection through the global log.
//!
//! # Overview
//!
//! The coordinator owns one [`ProjectionEngine`] per projector and moves each
//! of them forward in bounded *ticks*:
//!
//! 1. Acquire the projection's lease (single active consumer, fenced token)
//! 2. Read a batch after the checkpoint with `read_all`
//! 3. Apply events in order, committing the checkpoint after each one
//! 4. On an apply error or budget overrun, record a `ProcessingFailure`, mark
//!    the projection `failed` and stop at the failing event
//!
//! Operators act on projections through [`ProjectionCoordinator::rebuild_projection`]
//! and [`ProjectionCoordinator::resolve_failure`], which take the same lease.
//!
//! # State machine
//!
//! ```text
//!            apply error                    resolve retry/skip
//!  running ───────────────▶ failed ─────────────────────────────▶ running
//!     │  ▲                    ▲  │                                (or rebuilding
//!     │  │ target reached     │  │ resolve retry/skip              if a target
//!     ▼  │                    │  ▼                                 is pending)
//!  rebuilding ────────────────┘ rebuilding
//!            apply error
//! ```
//!
//! # Example
//!
//! ```ignore
//! let coordinator = Arc::new(
//!     ProjectionCoordinator::new(store.clone(), store, registry, ledger, CoordinatorConfig::default())
//!         .with_projector(Arc::new(EventTypeCountsProjector::new(projection_store))),
//! );
//! coordinator.initialize().await?;
//! let report = coordinator.tick("event_type_counts").await?;
//! ```

use crate::engine::ProjectionEngine;
use crate::retry::RetryPolicy;
use chronicle_core::environment::{Clock, SystemClock};
use chronicle_core::event::{EventId, GlobalSequence, RecordedEvent};
use chronicle_core::event_store::{EventStore, EventStoreError};
use chronicle_core::failure::{
    FailureFilter, FailureId, FailureLedger, ProcessingFailure, ResolutionAction,
};
use chronicle_core::lease::{Lease, LeaseOwner};
use chronicle_core::projection::{
    ProjectionError, ProjectionRegistry, ProjectionState, ProjectionStatus, ProjectionUpdate,
    Projector,
};
use chronicle_core::stream::StreamRegistry;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;

/// Resolver recorded when a re-attempt succeeds on its own.
pub const COORDINATOR_RESOLVER: &str = "coordinator";

/// `last_error` of a projection whose rebuild stopped between resetting the
/// checkpoint and clearing the read model. Only a new rebuild moves it on.
pub const REBUILD_INCOMPLETE: &str = "rebuild incomplete, run the rebuild again";

fn rebuild_incomplete(state: &ProjectionState) -> bool {
    state.status == ProjectionStatus::Failed
        && state
            .last_error
            .as_deref()
            .is_some_and(|error| error.starts_with(REBUILD_INCOMPLETE))
}

/// Errors returned by coordinator operations.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// No projector with this name is registered with the coordinator.
    #[error("Unknown projection: {0}")]
    UnknownProjection(String),

    /// The projection is rebuilding and its lease is held.
    #[error("Projection {0} is rebuilding")]
    RebuildInProgress(String),

    /// Another worker holds the projection's lease.
    #[error("Lease for projection {0} is held by another worker")]
    LeaseUnavailable(String),

    /// No failure record with this id.
    #[error("Failure not found: {0}")]
    FailureNotFound(FailureId),

    /// The failure was already resolved.
    #[error("Failure {0} is already resolved")]
    FailureAlreadyResolved(FailureId),

    /// Skipping this failure would jump over events that were never applied.
    #[error(
        "Failure {id} is not blocking projection {projection}: checkpoint is {checkpoint}, failed event is {global_sequence}"
    )]
    FailureNotBlocking {
        /// Failure record.
        id: FailureId,
        /// Projection of the record.
        projection: String,
        /// Projection's current checkpoint.
        checkpoint: GlobalSequence,
        /// Position of the failed event.
        global_sequence: GlobalSequence,
    },

    /// Event store error.
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// Projection storage or lease error.
    #[error(transparent)]
    Projection(#[from] ProjectionError),
}

impl CoordinatorError {
    /// Whether the error means another worker currently owns the projection.
    #[must_use]
    pub const fn is_contention(&self) -> bool {
        matches!(
            self,
            Self::LeaseUnavailable(_)
                | Self::RebuildInProgress(_)
                | Self::Projection(ProjectionError::LeaseLost { .. })
        )
    }

    /// Whether the error comes from unreachable storage.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Projection(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Maximum events read per tick.
    pub batch_size: usize,
    /// Wall-clock budget of one tick. An apply still running when it runs
    /// out counts as a failure of that event.
    pub tick_budget: Duration,
    /// Lease time-to-live. Renewed while a tick runs.
    pub lease_ttl: Duration,
    /// Pause between ticks of a caught-up projection.
    pub poll_interval: Duration,
    /// Lag above which a running projection is reported as lagging.
    pub lag_warning_threshold: u64,
    /// Time without progress, with events waiting, after which a running
    /// projection is reported as stalled.
    pub stall_after: Duration,
    /// Identity used when acquiring leases.
    pub owner: LeaseOwner,
    /// Backoff for workers after storage errors and repeated failures.
    pub retry: RetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            tick_budget: Duration::from_secs(5),
            lease_ttl: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            lag_warning_threshold: 1000,
            stall_after: Duration::from_secs(60),
            owner: LeaseOwner::generate(),
            retry: RetryPolicy::builder()
                .initial_delay(Duration::from_millis(500))
                .max_delay(Duration::from_secs(30))
                .build(),
        }
    }
}

impl CoordinatorConfig {
    /// Set the batch size (at least 1).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the tick budget.
    #[must_use]
    pub const fn with_tick_budget(mut self, budget: Duration) -> Self {
        self.tick_budget = budget;
        self
    }

    /// Set the lease time-to-live.
    #[must_use]
    pub const fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the lag warning threshold.
    #[must_use]
    pub const fn with_lag_warning_threshold(mut self, threshold: u64) -> Self {
        self.lag_warning_threshold = threshold;
        self
    }

    /// Set the stall threshold.
    #[must_use]
    pub const fn with_stall_after(mut self, stall_after: Duration) -> Self {
        self.stall_after = stall_after;
        self
    }

    /// Set the lease owner identity.
    #[must_use]
    pub fn with_owner(mut self, owner: LeaseOwner) -> Self {
        self.owner = owner;
        self
    }

    /// Set the worker backoff policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Health of a projection as shown to operators.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectionHealth {
    /// Running and close to the head.
    Healthy,
    /// Running but further behind than the warning threshold.
    Lagging,
    /// Events are waiting but nothing was applied for a while.
    Stalled,
    /// Replaying towards a rebuild target.
    Rebuilding,
    /// Blocked on a failed event.
    Failed,
}

impl ProjectionHealth {
    /// Name used in API responses.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Lagging => "lagging",
            Self::Stalled => "stalled",
            Self::Rebuilding => "rebuilding",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ProjectionHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monitoring view of one projection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ProjectionOverview {
    /// Projection name.
    pub name: String,
    /// Last applied global sequence.
    pub checkpoint: GlobalSequence,
    /// Head minus checkpoint.
    pub lag: u64,
    /// Lifecycle status.
    pub status: ProjectionStatus,
    /// Derived health.
    pub health: ProjectionHealth,
    /// Error blocking the projection, if any.
    pub last_error: Option<String>,
    /// Target of a running rebuild.
    pub rebuild_target: Option<GlobalSequence>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

/// System-wide monitoring summary.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Overview {
    /// Events in the store.
    pub total_events: u64,
    /// Streams holding at least one event.
    pub total_streams: u64,
    /// Every registered projection.
    pub projections: Vec<ProjectionOverview>,
    /// Failures still awaiting resolution.
    pub unresolved_failures_count: u64,
}

/// Acknowledgement of a started rebuild.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RebuildTicket {
    /// Projection being rebuilt.
    pub projection: String,
    /// Head captured at rebuild start.
    pub target: GlobalSequence,
    /// Status right after the reset (`running` when the log was empty).
    pub status: ProjectionStatus,
}

/// What a tick did.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TickReport {
    /// Projection ticked.
    pub projection: String,
    /// Events applied and committed.
    pub applied: usize,
    /// Checkpoint after the tick.
    pub checkpoint: GlobalSequence,
    /// Status after the tick.
    pub status: ProjectionStatus,
    /// The batch was short and fully applied: nothing is known to be waiting.
    pub caught_up: bool,
    /// The failure recorded by this tick.
    pub failure: Option<ProcessingFailure>,
}

struct Slot {
    engine: ProjectionEngine,
    wake: Arc<Notify>,
}

/// Schedules projections over the global log.
///
/// Holds only trait objects, so the same coordinator runs against Postgres in
/// production and the in-memory stores in tests.
pub struct ProjectionCoordinator {
    store: Arc<dyn EventStore>,
    streams: Arc<dyn StreamRegistry>,
    registry: Arc<dyn ProjectionRegistry>,
    failures: Arc<dyn FailureLedger>,
    slots: BTreeMap<String, Slot>,
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
}

impl ProjectionCoordinator {
    /// Create a coordinator with no projectors.
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        streams: Arc<dyn StreamRegistry>,
        registry: Arc<dyn ProjectionRegistry>,
        failures: Arc<dyn FailureLedger>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            streams,
            registry,
            failures,
            slots: BTreeMap::new(),
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for lease renewal and health assessment.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Add a projector. A later projector with the same name replaces the earlier one.
    #[must_use]
    pub fn with_projector(mut self, projector: Arc<dyn Projector>) -> Self {
        let engine = ProjectionEngine::new(projector, Arc::clone(&self.registry));
        self.slots.insert(
            engine.name().to_string(),
            Slot {
                engine,
                wake: Arc::new(Notify::new()),
            },
        );
        self
    }

    /// Coordinator configuration.
    #[must_use]
    pub const fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Names of the projectors, sorted.
    pub fn projection_names(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// Wake the worker of `name` so it ticks without waiting for the poll interval.
    pub fn wake(&self, name: &str) {
        if let Some(slot) = self.slots.get(name) {
            slot.wake.notify_one();
        }
    }

    /// Wake every worker, e.g. after an append.
    pub fn wake_all(&self) {
        for slot in self.slots.values() {
            slot.wake.notify_one();
        }
    }

    pub(crate) fn wake_handle(&self, name: &str) -> Option<Arc<Notify>> {
        self.slots.get(name).map(|slot| Arc::clone(&slot.wake))
    }

    /// Initialize every projector and register its projection.
    ///
    /// # Errors
    ///
    /// Returns the first projector or registry error.
    pub async fn initialize(&self) -> Result<Vec<ProjectionState>, CoordinatorError> {
        let mut states = Vec::with_capacity(self.slots.len());
        for slot in self.slots.values() {
            states.push(slot.engine.initialize().await?);
        }
        Ok(states)
    }

    fn slot(&self, name: &str) -> Result<&Slot, CoordinatorError> {
        self.slots
            .get(name)
            .ok_or_else(|| CoordinatorError::UnknownProjection(name.to_string()))
    }

    async fn acquire(&self, slot: &Slot) -> Result<Lease, CoordinatorError> {
        let name = slot.engine.name();
        if let Some(lease) = self
            .registry
            .try_acquire_lease(name, &self.config.owner, self.config.lease_ttl)
            .await?
        {
            return Ok(lease);
        }

        let state = slot.engine.state().await?;
        if state.status == ProjectionStatus::Rebuilding {
            Err(CoordinatorError::RebuildInProgress(name.to_string()))
        } else {
            Err(CoordinatorError::LeaseUnavailable(name.to_string()))
        }
    }

    async fn release(&self, lease: &Lease) {
        if let Err(e) = self.registry.release_lease(lease).await {
            tracing::warn!(
                projection = %lease.projection,
                token = lease.token,
                error = %e,
                "Failed to release projection lease"
            );
        }
    }

    async fn keep_alive(&self, lease: Lease) -> Result<Lease, CoordinatorError> {
        let half_ttl = chrono::Duration::from_std(self.config.lease_ttl / 2)
            .unwrap_or(chrono::Duration::MAX);
        if lease.expires_at - self.clock.now() > half_ttl {
            return Ok(lease);
        }
        Ok(self
            .registry
            .renew_lease(&lease, self.config.lease_ttl)
            .await?)
    }

    /// Advance one projection by at most one batch.
    ///
    /// # Errors
    ///
    /// - [`CoordinatorError::UnknownProjection`]: no such projector
    /// - [`CoordinatorError::LeaseUnavailable`] / [`CoordinatorError::RebuildInProgress`]:
    ///   another worker owns the projection
    /// - storage errors from the event store, registry or ledger
    ///
    /// An apply failure is not an error: it is recorded and reported in
    /// [`TickReport::failure`].
    pub async fn tick(&self, name: &str) -> Result<TickReport, CoordinatorError> {
        let slot = self.slot(name)?;
        let lease = self.acquire(slot).await?;
        let result = self.tick_with_lease(&slot.engine, lease.clone()).await;
        self.release(&lease).await;
        result
    }

    #[allow(clippy::cognitive_complexity)]
    async fn tick_with_lease(
        &self,
        engine: &ProjectionEngine,
        mut lease: Lease,
    ) -> Result<TickReport, CoordinatorError> {
        let name = engine.name();
        let started = Instant::now();
        let deadline = started + self.config.tick_budget;

        let mut state = engine.state().await?;
        if rebuild_incomplete(&state) {
            tracing::debug!(projection = name, "Waiting for the rebuild to be run again");
            return Ok(TickReport {
                projection: name.to_string(),
                applied: 0,
                checkpoint: state.checkpoint,
                status: state.status,
                caught_up: true,
                failure: None,
            });
        }
        let events = self
            .store
            .read_all(state.checkpoint, self.config.batch_size)
            .await?;
        let fetched = events.len();
        let open_failures: HashSet<EventId> = if events.is_empty() {
            HashSet::new()
        } else {
            self.failures
                .list(FailureFilter::unresolved_for(name))
                .await?
                .into_iter()
                .map(|f| f.event_id)
                .collect()
        };

        let mut applied = 0;
        let mut budget_exhausted = false;
        for event in &events {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                budget_exhausted = true;
                break;
            }

            let error = match tokio::time::timeout(remaining, engine.apply(event)).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(format!(
                    "apply exceeded the tick budget of {} ms",
                    self.config.tick_budget.as_millis()
                )),
            };

            if let Some(message) = error {
                let (failure, state) = self
                    .record_apply_failure(engine, &lease, event, &message)
                    .await?;
                record_tick_metrics(name, applied, started);
                return Ok(TickReport {
                    projection: name.to_string(),
                    applied,
                    checkpoint: state.checkpoint,
                    status: state.status,
                    caught_up: false,
                    failure: Some(failure),
                });
            }

            let recovered = open_failures.contains(&event.id);
            let unblocked = recovered
                || state.status == ProjectionStatus::Failed
                || state.last_error.is_some();
            let reached_target = state
                .rebuild_target
                .is_some_and(|target| event.global_sequence >= target);

            let mut update = ProjectionUpdate::default().checkpoint(event.global_sequence);
            if reached_target {
                update = update
                    .with_status(ProjectionStatus::Running)
                    .rebuild_target(None);
            } else if unblocked {
                update = update.with_status(if state.rebuild_target.is_some() {
                    ProjectionStatus::Rebuilding
                } else {
                    ProjectionStatus::Running
                });
            }
            if unblocked {
                update = update.clear_error();
            }

            state = engine.commit(&lease, update).await?;
            applied += 1;

            if recovered {
                self.failures.mark_recovered(name, event.id).await?;
                tracing::info!(
                    projection = name,
                    global_sequence = event.global_sequence.value(),
                    event_id = %event.id,
                    "Projection recovered after re-attempt"
                );
            }
            if reached_target {
                tracing::info!(
                    projection = name,
                    checkpoint = state.checkpoint.value(),
                    "Projection rebuild completed"
                );
                metrics::counter!(
                    "chronicle.projection.rebuilds_completed",
                    "projection" => name.to_string()
                )
                .increment(1);
            }

            lease = self.keep_alive(lease).await?;
        }

        if let Some(target) = state.rebuild_target {
            if state.status == ProjectionStatus::Rebuilding && state.checkpoint >= target {
                state = engine
                    .commit(
                        &lease,
                        ProjectionUpdate::default()
                            .with_status(ProjectionStatus::Running)
                            .rebuild_target(None),
                    )
                    .await?;
                tracing::info!(
                    projection = name,
                    checkpoint = state.checkpoint.value(),
                    "Projection rebuild completed"
                );
            }
        }

        if applied > 0 {
            tracing::debug!(
                projection = name,
                applied,
                checkpoint = state.checkpoint.value(),
                "Tick applied events"
            );
        }
        if budget_exhausted {
            tracing::debug!(projection = name, applied, "Tick budget exhausted");
        }
        record_tick_metrics(name, applied, started);

        Ok(TickReport {
            projection: name.to_string(),
            applied,
            checkpoint: state.checkpoint,
            status: state.status,
            caught_up: !budget_exhausted && fetched < self.config.batch_size,
            failure: None,
        })
    }

    async fn record_apply_failure(
        &self,
        engine: &ProjectionEngine,
        lease: &Lease,
        event: &RecordedEvent,
        message: &str,
    ) -> Result<(ProcessingFailure, ProjectionState), CoordinatorError> {
        let name = engine.name();
        let failure = self.failures.record_failure(name, event, message).await?;
        let state = engine
            .commit(
                lease,
                ProjectionUpdate::default()
                    .with_status(ProjectionStatus::Failed)
                    .with_error(message),
            )
            .await?;

        tracing::warn!(
            projection = name,
            global_sequence = event.global_sequence.value(),
            event_id = %event.id,
            event_type = %event.event_type,
            attempt = failure.attempt_count,
            error = message,
            "Projection failed to apply event"
        );
        metrics::counter!("chronicle.projection.apply_failures", "projection" => name.to_string())
            .increment(1);

        Ok((failure, state))
    }

    /// Reset a projection and replay it from the start of the log.
    ///
    /// Under the lease: clears the read model, sets checkpoint 0, captures the
    /// current head as the rebuild target and marks the projection
    /// `rebuilding` (or `running` straight away when the log is empty). The
    /// replay itself happens in later ticks; see [`ProjectionCoordinator::drive_rebuild`].
    ///
    /// Calling it again while no worker holds the lease restarts the rebuild
    /// with a fresh target. If the reset fails or the lease is lost midway,
    /// the projection is left `failed` at checkpoint 0 with
    /// [`REBUILD_INCOMPLETE`] as its error, and ticks skip it until the
    /// rebuild is run again.
    ///
    /// # Errors
    ///
    /// - [`CoordinatorError::UnknownProjection`]: no such projector
    /// - [`CoordinatorError::RebuildInProgress`]: a rebuild is being driven right now
    /// - [`CoordinatorError::LeaseUnavailable`]: a tick is running right now
    pub async fn rebuild_projection(&self, name: &str) -> Result<RebuildTicket, CoordinatorError> {
        let slot = self.slot(name)?;
        let lease = self.acquire(slot).await?;
        let result = self.start_rebuild(&slot.engine, &lease).await;
        self.release(&lease).await;
        slot.wake.notify_one();
        result
    }

    async fn start_rebuild(
        &self,
        engine: &ProjectionEngine,
        lease: &Lease,
    ) -> Result<RebuildTicket, CoordinatorError> {
        let name = engine.name();
        let head = self.store.head().await?;

        // Ticks hold off in this state until the rebuild below commits
        engine
            .commit(
                lease,
                ProjectionUpdate::default()
                    .checkpoint(GlobalSequence::ZERO)
                    .with_status(ProjectionStatus::Failed)
                    .with_error(REBUILD_INCOMPLETE)
                    .rebuild_target(None),
            )
            .await?;
        let lease = self.keep_alive(lease.clone()).await?;

        if let Err(e) = engine.reset().await {
            tracing::error!(
                projection = name,
                error = %e,
                "Failed to clear read model for rebuild"
            );
            let update =
                ProjectionUpdate::default().with_error(format!("{REBUILD_INCOMPLETE}: {e}"));
            if let Err(commit_error) = engine.commit(&lease, update).await {
                tracing::warn!(
                    projection = name,
                    error = %commit_error,
                    "Failed to record rebuild reset error"
                );
            }
            return Err(e.into());
        }
        let lease = self.keep_alive(lease).await?;

        let (status, target) = if head == GlobalSequence::ZERO {
            (ProjectionStatus::Running, None)
        } else {
            (ProjectionStatus::Rebuilding, Some(head))
        };
        let state = engine
            .commit(
                &lease,
                ProjectionUpdate::default()
                    .with_status(status)
                    .clear_error()
                    .rebuild_target(target),
            )
            .await?;

        tracing::info!(
            projection = name,
            target = head.value(),
            "Projection rebuild started"
        );
        metrics::counter!("chronicle.projection.rebuilds_started", "projection" => name.to_string())
            .increment(1);

        Ok(RebuildTicket {
            projection: name.to_string(),
            target: head,
            status: state.status,
        })
    }

    /// Tick `name` until its rebuild completes, it fails, or `shutdown` fires.
    ///
    /// Returns the projection state at that point. Stopping leaves the
    /// checkpoint on the last committed event.
    ///
    /// # Errors
    ///
    /// Returns non-transient, non-contention errors from [`ProjectionCoordinator::tick`].
    pub async fn drive_rebuild(
        &self,
        name: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ProjectionState, CoordinatorError> {
        let slot = self.slot(name)?;
        loop {
            let state = slot.engine.state().await?;
            if state.status != ProjectionStatus::Rebuilding {
                return Ok(state);
            }
            if *shutdown.borrow() {
                tracing::info!(
                    projection = name,
                    checkpoint = state.checkpoint.value(),
                    "Rebuild interrupted by shutdown"
                );
                return Ok(state);
            }

            let pause = match self.tick(name).await {
                Ok(report) if report.caught_up || report.failure.is_some() => {
                    Some(self.config.poll_interval)
                }
                Ok(_) => None,
                Err(e) if e.is_contention() || e.is_transient() => {
                    tracing::debug!(projection = name, error = %e, "Rebuild tick deferred");
                    Some(self.config.poll_interval)
                }
                Err(e) => return Err(e),
            };

            if let Some(pause) = pause {
                tokio::select! {
                    () = tokio::time::sleep(pause) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            return Ok(slot.engine.state().await?);
                        }
                    }
                }
            }
        }
    }

    /// System-wide monitoring summary.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn overview(&self) -> Result<Overview, CoordinatorError> {
        let head = self.store.head().await?;
        let total_streams = self.streams.stream_count().await?;
        let projections = self.projections_at(head).await?;
        let unresolved_failures_count = self.failures.count_unresolved(None).await?;

        Ok(Overview {
            total_events: head.value(),
            total_streams,
            projections,
            unresolved_failures_count,
        })
    }

    /// Monitoring view of every registered projection.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn projections(&self) -> Result<Vec<ProjectionOverview>, CoordinatorError> {
        let head = self.store.head().await?;
        self.projections_at(head).await
    }

    /// Monitoring view of one projection.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::UnknownProjection`] if it is not registered.
    pub async fn projection(&self, name: &str) -> Result<ProjectionOverview, CoordinatorError> {
        let state = self
            .registry
            .load(name)
            .await?
            .ok_or_else(|| CoordinatorError::UnknownProjection(name.to_string()))?;
        let head = self.store.head().await?;
        self.describe(state, head, self.clock.now()).await
    }

    async fn projections_at(
        &self,
        head: GlobalSequence,
    ) -> Result<Vec<ProjectionOverview>, CoordinatorError> {
        let now = self.clock.now();
        let mut overviews = Vec::new();
        for state in self.registry.list().await? {
            overviews.push(self.describe(state, head, now).await?);
        }
        Ok(overviews)
    }

    #[allow(clippy::cast_precision_loss)] // Lag gauge precision is irrelevant
    async fn describe(
        &self,
        state: ProjectionState,
        head: GlobalSequence,
        now: DateTime<Utc>,
    ) -> Result<ProjectionOverview, CoordinatorError> {
        let lag = state.lag(head);
        let health = self.assess(&state, lag, now).await?;
        metrics::gauge!("chronicle.projection.lag", "projection" => state.name.clone())
            .set(lag as f64);

        Ok(ProjectionOverview {
            name: state.name,
            checkpoint: state.checkpoint,
            lag,
            status: state.status,
            health,
            last_error: state.last_error,
            rebuild_target: state.rebuild_target,
            updated_at: state.updated_at,
        })
    }

    async fn assess(
        &self,
        state: &ProjectionState,
        lag: u64,
        now: DateTime<Utc>,
    ) -> Result<ProjectionHealth, CoordinatorError> {
        match state.status {
            ProjectionStatus::Failed => return Ok(ProjectionHealth::Failed),
            ProjectionStatus::Rebuilding => return Ok(ProjectionHealth::Rebuilding),
            ProjectionStatus::Running => {}
        }
        if lag == 0 {
            return Ok(ProjectionHealth::Healthy);
        }

        if elapsed(state.updated_at, now) >= self.config.stall_after {
            // Only stalled if the next event has itself been waiting that long
            let next = self.store.read_all(state.checkpoint, 1).await?;
            if next
                .first()
                .is_some_and(|event| elapsed(event.recorded_at, now) >= self.config.stall_after)
            {
                return Ok(ProjectionHealth::Stalled);
            }
        }

        if lag > self.config.lag_warning_threshold {
            Ok(ProjectionHealth::Lagging)
        } else {
            Ok(ProjectionHealth::Healthy)
        }
    }

    /// Failures matching `filter`, most recent first.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn list_failures(
        &self,
        filter: FailureFilter,
    ) -> Result<Vec<ProcessingFailure>, CoordinatorError> {
        Ok(self.failures.list(filter).await?)
    }

    /// One failure record.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::FailureNotFound`] if there is no such record.
    pub async fn get_failure(&self, id: FailureId) -> Result<ProcessingFailure, CoordinatorError> {
        self.failures
            .get(id)
            .await?
            .ok_or(CoordinatorError::FailureNotFound(id))
    }

    /// Apply an operator decision to a failure.
    ///
    /// - `retry`: the projection goes back to `running` (or `rebuilding`) and
    ///   the next tick re-attempts the event; the record stays open until the
    ///   re-attempt succeeds
    /// - `skip`: the checkpoint moves past the event without applying it and
    ///   the record is resolved
    /// - `ignore`: the record is resolved; the projection is untouched
    ///
    /// # Errors
    ///
    /// - [`CoordinatorError::FailureNotFound`]: no such record
    /// - [`CoordinatorError::FailureAlreadyResolved`]: the record is closed
    ///   and the action cannot reopen it
    /// - [`CoordinatorError::FailureNotBlocking`]: a skip would jump over
    ///   unapplied events
    /// - [`CoordinatorError::UnknownProjection`]: the record's projection has
    ///   no projector here
    /// - lease contention as for [`ProjectionCoordinator::tick`]
    pub async fn resolve_failure(
        &self,
        id: FailureId,
        resolved_by: &str,
        action: ResolutionAction,
    ) -> Result<ProcessingFailure, CoordinatorError> {
        let failure = self.get_failure(id).await?;
        if failure.is_resolved() && action != ResolutionAction::Retry {
            return Err(CoordinatorError::FailureAlreadyResolved(id));
        }

        if action == ResolutionAction::Ignore {
            let resolved = self.failures.resolve(id, resolved_by, action).await?;
            tracing::info!(
                failure_id = %id,
                projection = %failure.projection_name,
                resolved_by,
                "Failure ignored"
            );
            return Ok(resolved);
        }

        let slot = self.slot(&failure.projection_name)?;
        let lease = self.acquire(slot).await?;
        let result = self
            .resolve_with_lease(&slot.engine, &lease, &failure, resolved_by, action)
            .await;
        self.release(&lease).await;
        slot.wake.notify_one();
        result
    }

    async fn resolve_with_lease(
        &self,
        engine: &ProjectionEngine,
        lease: &Lease,
        failure: &ProcessingFailure,
        resolved_by: &str,
        action: ResolutionAction,
    ) -> Result<ProcessingFailure, CoordinatorError> {
        let state = engine.state().await?;
        if rebuild_incomplete(&state) {
            return Err(CoordinatorError::RebuildInProgress(
                failure.projection_name.clone(),
            ));
        }
        let resume_status = if state.rebuild_target.is_some() {
            ProjectionStatus::Rebuilding
        } else {
            ProjectionStatus::Running
        };

        match action {
            ResolutionAction::Retry => {
                if failure.is_resolved() && state.checkpoint >= failure.global_sequence {
                    return Err(CoordinatorError::FailureAlreadyResolved(failure.id));
                }
                if state.status == ProjectionStatus::Failed {
                    engine
                        .commit(lease, ProjectionUpdate::default().with_status(resume_status))
                        .await?;
                }
                tracing::info!(
                    failure_id = %failure.id,
                    projection = %failure.projection_name,
                    global_sequence = failure.global_sequence.value(),
                    resolved_by,
                    "Failure scheduled for retry"
                );
            }
            ResolutionAction::Skip => {
                if state.checkpoint.next() < failure.global_sequence {
                    return Err(CoordinatorError::FailureNotBlocking {
                        id: failure.id,
                        projection: failure.projection_name.clone(),
                        checkpoint: state.checkpoint,
                        global_sequence: failure.global_sequence,
                    });
                }
                let checkpoint = state.checkpoint.max(failure.global_sequence);
                let mut update = ProjectionUpdate::default()
                    .checkpoint(checkpoint)
                    .clear_error()
                    .with_status(resume_status);
                if state.rebuild_target.is_some_and(|target| checkpoint >= target) {
                    update = update
                        .with_status(ProjectionStatus::Running)
                        .rebuild_target(None);
                }
                engine.commit(lease, update).await?;
                tracing::warn!(
                    failure_id = %failure.id,
                    projection = %failure.projection_name,
                    global_sequence = failure.global_sequence.value(),
                    event_id = %failure.event_id,
                    event_type = %failure.event_type,
                    resolved_by,
                    "Skipping event: it will never be applied to this projection"
                );
            }
            ResolutionAction::Ignore => {}
        }

        Ok(self.failures.resolve(failure.id, resolved_by, action).await?)
    }
}

impl std::fmt::Debug for ProjectionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionCoordinator")
            .field("projections", &self.slots.keys().collect::<Vec<_>>())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

#[allow(clippy::cast_precision_loss)]
fn record_tick_metrics(name: &str, applied: usize, started: Instant) {
    metrics::counter!("chronicle.projection.events_applied", "projection" => name.to_string())
        .increment(applied as u64);
    metrics::histogram!("chronicle.projection.tick.duration", "projection" => name.to_string())
        .record(started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contention_and_transient_classification() {
        assert!(CoordinatorError::LeaseUnavailable("p".into()).is_contention());
        assert!(CoordinatorError::RebuildInProgress("p".into()).is_contention());
        assert!(
            CoordinatorError::Projection(ProjectionError::LeaseLost {
                projection: "p".into()
            })
            .is_contention()
        );
        assert!(
            CoordinatorError::Store(EventStoreError::StorageUnavailable("down".into()))
                .is_transient()
        );
        assert!(!CoordinatorError::UnknownProjection("p".into()).is_transient());
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.tick_budget, Duration::from_secs(5));
        assert_eq!(config.lease_ttl, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.lag_warning_threshold, 1000);
        assert_eq!(config.stall_after, Duration::from_secs(60));
        assert_eq!(CoordinatorConfig::default().with_batch_size(0).batch_size, 1);
    }

    #[test]
    fn health_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ProjectionHealth::Stalled).ok().as_deref(),
            Some("\"stalled\"")
        );
    }
}
