//! Background workers: one task per projection, ticking until shutdown.
//!
//! Each worker calls [`ProjectionCoordinator::tick`] in a loop and decides how
//! long to wait before the next tick:
//!
//! | tick outcome                         | wait                                 |
//! |--------------------------------------|--------------------------------------|
//! | applied a full batch                 | none                                 |
//! | caught up                            | poll interval, or until woken        |
//! | apply failure                        | backoff by the failure's attempt count |
//! | lease held elsewhere                 | poll interval                        |
//! | storage unavailable                  | backoff by consecutive errors        |
//!
//! A failing projection never stops the others: every worker owns its own
//! loop and a failure only changes its own backoff.

use crate::coordinator::{CoordinatorError, ProjectionCoordinator};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

/// Drives one projection until shutdown.
#[derive(Debug)]
pub struct ProjectionWorker {
    coordinator: Arc<ProjectionCoordinator>,
    projection: String,
    wake: Arc<Notify>,
}

impl ProjectionWorker {
    /// Create a worker for `projection`.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::UnknownProjection`] if the coordinator has
    /// no projector with that name.
    pub fn new(
        coordinator: Arc<ProjectionCoordinator>,
        projection: impl Into<String>,
    ) -> Result<Self, CoordinatorError> {
        let projection = projection.into();
        let wake = coordinator
            .wake_handle(&projection)
            .ok_or_else(|| CoordinatorError::UnknownProjection(projection.clone()))?;
        Ok(Self {
            coordinator,
            projection,
            wake,
        })
    }

    /// Projection driven by this worker.
    #[must_use]
    pub fn projection(&self) -> &str {
        &self.projection
    }

    /// Tick until `shutdown` becomes `true` or its sender is dropped.
    ///
    /// An in-flight tick is finished before returning, so the checkpoint
    /// always matches the last applied event.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let name = self.projection.as_str();
        let config = self.coordinator.config().clone();
        let mut consecutive_errors: usize = 0;

        tracing::info!(projection = name, "Projection worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let pause = match self.coordinator.tick(name).await {
                Ok(report) => {
                    consecutive_errors = 0;
                    if let Some(failure) = &report.failure {
                        let attempt = usize::try_from(failure.attempt_count).unwrap_or(usize::MAX);
                        Some(config.retry.delay_for_attempt(attempt.saturating_sub(1)))
                    } else if report.caught_up {
                        Some(config.poll_interval)
                    } else {
                        None
                    }
                }
                Err(e) if e.is_contention() => {
                    consecutive_errors = 0;
                    tracing::trace!(projection = name, error = %e, "Projection owned elsewhere");
                    Some(config.poll_interval)
                }
                Err(e) if e.is_transient() => {
                    let delay = config.retry.delay_for_attempt(consecutive_errors);
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    tracing::warn!(
                        projection = name,
                        error = %e,
                        attempt = consecutive_errors,
                        delay_ms = delay.as_millis(),
                        "Storage unavailable, backing off"
                    );
                    Some(delay)
                }
                Err(e) => {
                    tracing::error!(projection = name, error = %e, "Projection tick failed");
                    Some(config.poll_interval)
                }
            };

            match pause {
                Some(pause) => {
                    if !self.pause(pause, &mut shutdown).await {
                        break;
                    }
                }
                None => tokio::task::yield_now().await,
            }
        }

        tracing::info!(projection = name, "Projection worker stopped");
    }

    /// Wait for `pause`, a wake-up or shutdown. Returns `false` on shutdown.
    async fn pause(&self, pause: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            () = tokio::time::sleep(pause) => true,
            () = self.wake.notified() => true,
            changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
        }
    }
}

/// The set of running projection workers.
///
/// # Example
///
/// ```ignore
/// let (pool, shutdown) = WorkerPool::spawn(Arc::clone(&coordinator))?;
/// // ... serve traffic ...
/// shutdown.send(true)?;
/// pool.join().await;
/// ```
#[derive(Debug)]
pub struct WorkerPool {
    handles: Vec<(String, JoinHandle<()>)>,
}

impl WorkerPool {
    /// Spawn one worker per projector of `coordinator`.
    ///
    /// Returns the pool and the shutdown sender; send `true` (or drop it) to
    /// stop every worker.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinatorError::UnknownProjection`] only if the coordinator
    /// changed between listing and spawning, which cannot happen through
    /// the public API.
    pub fn spawn(
        coordinator: Arc<ProjectionCoordinator>,
    ) -> Result<(Self, watch::Sender<bool>), CoordinatorError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let names: Vec<String> = coordinator.projection_names().map(str::to_string).collect();

        let mut handles = Vec::with_capacity(names.len());
        for name in names {
            let worker = ProjectionWorker::new(Arc::clone(&coordinator), name.clone())?;
            let handle = tokio::spawn(worker.run(shutdown_rx.clone()));
            handles.push((name, handle));
        }

        tracing::info!(workers = handles.len(), "Projection workers spawned");
        Ok((Self { handles }, shutdown_tx))
    }

    /// Number of workers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool has no workers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to stop.
    pub async fn join(self) {
        let (names, handles): (Vec<_>, Vec<_>) = self.handles.into_iter().unzip();
        let results = futures::future::join_all(handles).await;
        for (name, result) in names.iter().zip(results) {
            if let Err(e) = result {
                tracing::error!(projection = %name, error = %e, "Projection worker panicked");
            }
        }
    }
}
