//! Ledger of events a projector failed to apply.
//!
//! A failure record is keyed by `(projection_name, event_id)`. Re-failing the
//! same event bumps `attempt_count` instead of creating a new record, so the
//! ledger holds at most one record per poison event and projection.
//!
//! Records are never deleted; resolution stamps `resolved_at`, `resolved_by`
//! and `resolution_action`.

use crate::BoxFuture;
use crate::event::{EventId, GlobalSequence, RecordedEvent};
use crate::projection::{ProjectionError, Result};
use crate::stream::StreamId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a failure record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FailureId(i64);

impl FailureId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// The raw id.
    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for FailureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FailureId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// Operator decision about a failure.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionAction {
    /// Re-attempt the event on the next tick.
    Retry,
    /// Advance the checkpoint past the event without applying it.
    Skip,
    /// Close the record without touching the projection.
    Ignore,
}

impl ResolutionAction {
    /// Stored and serialized name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Skip => "skip",
            Self::Ignore => "ignore",
        }
    }
}

impl fmt::Display for ResolutionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionAction {
    type Err = ProjectionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "retry" => Ok(Self::Retry),
            "skip" => Ok(Self::Skip),
            "ignore" => Ok(Self::Ignore),
            other => Err(ProjectionError::Serialization(format!(
                "unknown resolution action '{other}'"
            ))),
        }
    }
}

/// A recorded projection failure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingFailure {
    /// Record id.
    pub id: FailureId,
    /// Projection that failed.
    pub projection_name: String,
    /// Event that could not be applied.
    pub event_id: EventId,
    /// Position of that event in the log.
    pub global_sequence: GlobalSequence,
    /// Stream of that event.
    pub stream_id: StreamId,
    /// Type of that event.
    pub event_type: String,
    /// Message of the latest failure.
    pub error_message: String,
    /// Number of failed attempts.
    pub attempt_count: u32,
    /// First failure.
    pub first_failed_at: DateTime<Utc>,
    /// Latest failure.
    pub last_failed_at: DateTime<Utc>,
    /// When the record was resolved.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who resolved it (operator name or `"coordinator"`).
    pub resolved_by: Option<String>,
    /// Latest resolution action.
    pub resolution_action: Option<ResolutionAction>,
}

impl ProcessingFailure {
    /// Whether the record has been resolved.
    #[must_use]
    pub const fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Filter for [`FailureLedger::list`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureFilter {
    /// Only failures of this projection.
    pub projection_name: Option<String>,
    /// Only resolved (`true`) or unresolved (`false`) failures.
    pub resolved: Option<bool>,
    /// Maximum number of records.
    pub limit: Option<usize>,
}

impl FailureFilter {
    /// Default and maximum page size.
    pub const MAX_LIMIT: usize = 500;

    /// Unresolved failures of one projection.
    #[must_use]
    pub fn unresolved_for(projection: impl Into<String>) -> Self {
        Self {
            projection_name: Some(projection.into()),
            resolved: Some(false),
            limit: None,
        }
    }

    /// The page size actually used.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(Self::MAX_LIMIT).clamp(1, Self::MAX_LIMIT)
    }

    /// Whether `failure` passes the filter (limit excluded).
    #[must_use]
    pub fn matches(&self, failure: &ProcessingFailure) -> bool {
        self.projection_name
            .as_deref()
            .is_none_or(|name| name == failure.projection_name)
            && self
                .resolved
                .is_none_or(|resolved| resolved == failure.is_resolved())
    }
}

/// Durable ledger of projection failures.
///
/// # Dyn Compatibility
///
/// This trait uses explicit boxed futures so the coordinator can hold an
/// `Arc<dyn FailureLedger>`.
pub trait FailureLedger: Send + Sync {
    /// Record that `projection_name` failed to apply `event`.
    ///
    /// Upserts by `(projection_name, event_id)`: a repeat increments
    /// `attempt_count`, updates `error_message` and `last_failed_at`, and
    /// reopens a resolved record.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on storage failure.
    fn record_failure<'a>(
        &'a self,
        projection_name: &'a str,
        event: &'a RecordedEvent,
        error_message: &'a str,
    ) -> BoxFuture<'a, Result<ProcessingFailure>>;

    /// Fetch one record.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on storage failure.
    fn get(&self, id: FailureId) -> BoxFuture<'_, Result<Option<ProcessingFailure>>>;

    /// Stamp a resolution on a record.
    ///
    /// `Retry` leaves `resolved_at` empty (the event is still blocking until
    /// it applies); `Skip` and `Ignore` set it.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::NotFound`]: no record with this id
    /// - [`ProjectionError::Storage`]: storage failure
    fn resolve<'a>(
        &'a self,
        id: FailureId,
        resolved_by: &'a str,
        action: ResolutionAction,
    ) -> BoxFuture<'a, Result<ProcessingFailure>>;

    /// Mark the unresolved record for `(projection_name, event_id)` resolved
    /// after the event applied successfully. Returns the record if one was open.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on storage failure.
    fn mark_recovered<'a>(
        &'a self,
        projection_name: &'a str,
        event_id: EventId,
    ) -> BoxFuture<'a, Result<Option<ProcessingFailure>>>;

    /// Records matching `filter`, most recently failed first.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on storage failure.
    fn list(&self, filter: FailureFilter) -> BoxFuture<'_, Result<Vec<ProcessingFailure>>>;

    /// Number of unresolved records, optionally for one projection.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] on storage failure.
    fn count_unresolved<'a>(&'a self, projection_name: Option<&'a str>)
    -> BoxFuture<'a, Result<u64>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(projection: &str, resolved: bool) -> ProcessingFailure {
        let now = Utc::now();
        ProcessingFailure {
            id: FailureId::new(1),
            projection_name: projection.into(),
            event_id: EventId::generate(),
            global_sequence: GlobalSequence::new(11),
            stream_id: StreamId::new("ticket-42"),
            event_type: "TicketReserved.v1".into(),
            error_message: "boom".into(),
            attempt_count: 1,
            first_failed_at: now,
            last_failed_at: now,
            resolved_at: resolved.then_some(now),
            resolved_by: None,
            resolution_action: None,
        }
    }

    #[test]
    fn filter_matches_projection_and_resolution() {
        let filter = FailureFilter::unresolved_for("ticket_stats");
        assert!(filter.matches(&failure("ticket_stats", false)));
        assert!(!filter.matches(&failure("ticket_stats", true)));
        assert!(!filter.matches(&failure("other", false)));
        assert!(FailureFilter::default().matches(&failure("other", true)));
    }

    #[test]
    fn filter_limit_is_clamped() {
        assert_eq!(FailureFilter::default().effective_limit(), 500);
        let filter = FailureFilter {
            limit: Some(0),
            ..FailureFilter::default()
        };
        assert_eq!(filter.effective_limit(), 1);
    }

    #[test]
    fn actions_parse_and_serialize_lowercase() {
        assert_eq!("skip".parse::<ResolutionAction>().ok(), Some(ResolutionAction::Skip));
        assert!("delete".parse::<ResolutionAction>().is_err());
        assert_eq!(
            serde_json::to_string(&ResolutionAction::Ignore).ok().as_deref(),
            Some("\"ignore\"")
        );
    }
}
