//! In-memory failure ledger.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use chronicle_core::BoxFuture;
use chronicle_core::environment::{Clock, SystemClock};
use chronicle_core::event::{EventId, RecordedEvent};
use chronicle_core::failure::{
    FailureFilter, FailureId, FailureLedger, ProcessingFailure, ResolutionAction,
};
use chronicle_core::projection::{ProjectionError, Result};
use std::sync::{Arc, RwLock};

/// Resolver name stamped by [`FailureLedger::mark_recovered`].
const RECOVERY_RESOLVER: &str = "coordinator";

#[derive(Debug, Default)]
struct Ledger {
    failures: Vec<ProcessingFailure>,
    next_id: i64,
}

/// In-memory [`FailureLedger`]. Clones share the same records.
#[derive(Clone)]
pub struct InMemoryFailureLedger {
    ledger: Arc<RwLock<Ledger>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryFailureLedger {
    /// Create an empty ledger using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty ledger stamping times with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger: Arc::new(RwLock::new(Ledger::default())),
            clock,
        }
    }

    /// Every record, in insertion order.
    #[must_use]
    pub fn all(&self) -> Vec<ProcessingFailure> {
        self.ledger.read().unwrap().failures.clone()
    }
}

impl Default for InMemoryFailureLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryFailureLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryFailureLedger")
            .field("failures", &self.ledger.read().unwrap().failures.len())
            .finish_non_exhaustive()
    }
}

impl FailureLedger for InMemoryFailureLedger {
    fn record_failure<'a>(
        &'a self,
        projection_name: &'a str,
        event: &'a RecordedEvent,
        error_message: &'a str,
    ) -> BoxFuture<'a, Result<ProcessingFailure>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut ledger = self.ledger.write().unwrap();

            if let Some(existing) = ledger
                .failures
                .iter_mut()
                .find(|f| f.projection_name == projection_name && f.event_id == event.id)
            {
                existing.attempt_count += 1;
                existing.error_message = error_message.to_string();
                existing.last_failed_at = now;
                existing.resolved_at = None;
                existing.resolved_by = None;
                existing.resolution_action = None;
                return Ok(existing.clone());
            }

            ledger.next_id += 1;
            let failure = ProcessingFailure {
                id: FailureId::new(ledger.next_id),
                projection_name: projection_name.to_string(),
                event_id: event.id,
                global_sequence: event.global_sequence,
                stream_id: event.stream_id.clone(),
                event_type: event.event_type.clone(),
                error_message: error_message.to_string(),
                attempt_count: 1,
                first_failed_at: now,
                last_failed_at: now,
                resolved_at: None,
                resolved_by: None,
                resolution_action: None,
            };
            ledger.failures.push(failure.clone());
            Ok(failure)
        })
    }

    fn get(&self, id: FailureId) -> BoxFuture<'_, Result<Option<ProcessingFailure>>> {
        Box::pin(async move {
            Ok(self
                .ledger
                .read()
                .unwrap()
                .failures
                .iter()
                .find(|f| f.id == id)
                .cloned())
        })
    }

    fn resolve<'a>(
        &'a self,
        id: FailureId,
        resolved_by: &'a str,
        action: ResolutionAction,
    ) -> BoxFuture<'a, Result<ProcessingFailure>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut ledger = self.ledger.write().unwrap();
            let failure = ledger
                .failures
                .iter_mut()
                .find(|f| f.id == id)
                .ok_or_else(|| ProjectionError::NotFound(format!("failure {id}")))?;
            failure.resolved_at = match action {
                ResolutionAction::Retry => None,
                ResolutionAction::Skip | ResolutionAction::Ignore => Some(now),
            };
            failure.resolved_by = Some(resolved_by.to_string());
            failure.resolution_action = Some(action);
            Ok(failure.clone())
        })
    }

    fn mark_recovered<'a>(
        &'a self,
        projection_name: &'a str,
        event_id: EventId,
    ) -> BoxFuture<'a, Result<Option<ProcessingFailure>>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut ledger = self.ledger.write().unwrap();
            Ok(ledger
                .failures
                .iter_mut()
                .find(|f| {
                    f.projection_name == projection_name
                        && f.event_id == event_id
                        && !f.is_resolved()
                })
                .map(|failure| {
                    failure.resolved_at = Some(now);
                    failure.resolved_by = Some(RECOVERY_RESOLVER.to_string());
                    failure.resolution_action = Some(ResolutionAction::Retry);
                    failure.clone()
                }))
        })
    }

    fn list(&self, filter: FailureFilter) -> BoxFuture<'_, Result<Vec<ProcessingFailure>>> {
        Box::pin(async move {
            let mut failures: Vec<_> = self
                .ledger
                .read()
                .unwrap()
                .failures
                .iter()
                .filter(|f| filter.matches(f))
                .cloned()
                .collect();
            failures.sort_by(|a, b| {
                b.last_failed_at
                    .cmp(&a.last_failed_at)
                    .then_with(|| b.id.cmp(&a.id))
            });
            failures.truncate(filter.effective_limit());
            Ok(failures)
        })
    }

    fn count_unresolved<'a>(
        &'a self,
        projection_name: Option<&'a str>,
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            Ok(self
                .ledger
                .read()
                .unwrap()
                .failures
                .iter()
                .filter(|f| !f.is_resolved())
                .filter(|f| projection_name.is_none_or(|name| name == f.projection_name))
                .count() as u64)
        })
    }
}
