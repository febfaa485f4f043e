//! Failure ledger for projection errors.
//!
//! Keeps one row per `(projection_name, event_id)`. Repeated failures of the
//! same event bump `attempt_count` on that row instead of adding new ones, so
//! the ledger shows operators which events are blocking which projections.

use crate::i64_to_u64;
use chronicle_core::BoxFuture;
use chronicle_core::event::{EventId, GlobalSequence, RecordedEvent};
use chronicle_core::failure::{
    FailureFilter, FailureId, FailureLedger, ProcessingFailure, ResolutionAction,
};
use chronicle_core::projection::{ProjectionError, Result};
use chronicle_core::stream::StreamId;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

const FAILURE_COLUMNS: &str = "id, projection_name, event_id, global_sequence, stream_id, \
                               event_type, error_message, attempt_count, first_failed_at, \
                               last_failed_at, resolved_at, resolved_by, resolution_action";

/// Resolver name stamped on records closed by a successful re-apply.
pub const RECOVERY_RESOLVER: &str = "coordinator";

fn storage(e: sqlx::Error) -> ProjectionError {
    ProjectionError::Storage(e.to_string())
}

fn failure_from_row(row: &PgRow) -> Result<ProcessingFailure> {
    let id: i64 = row.try_get("id").map_err(storage)?;
    let event_id: Uuid = row.try_get("event_id").map_err(storage)?;
    let global_sequence: i64 = row.try_get("global_sequence").map_err(storage)?;
    let stream_id: String = row.try_get("stream_id").map_err(storage)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(storage)?;
    let resolution_action: Option<String> = row.try_get("resolution_action").map_err(storage)?;

    Ok(ProcessingFailure {
        id: FailureId::new(id),
        projection_name: row.try_get("projection_name").map_err(storage)?,
        event_id: EventId::from_uuid(event_id),
        global_sequence: GlobalSequence::new(
            i64_to_u64(global_sequence).map_err(|e| ProjectionError::Storage(e.to_string()))?,
        ),
        stream_id: StreamId::new(stream_id),
        event_type: row.try_get("event_type").map_err(storage)?,
        error_message: row.try_get("error_message").map_err(storage)?,
        attempt_count: u32::try_from(attempt_count).unwrap_or(0),
        first_failed_at: row.try_get("first_failed_at").map_err(storage)?,
        last_failed_at: row.try_get("last_failed_at").map_err(storage)?,
        resolved_at: row.try_get("resolved_at").map_err(storage)?,
        resolved_by: row.try_get("resolved_by").map_err(storage)?,
        resolution_action: resolution_action
            .as_deref()
            .map(str::parse::<ResolutionAction>)
            .transpose()?,
    })
}

/// `PostgreSQL` implementation of [`FailureLedger`].
///
/// # Example
///
/// ```no_run
/// use chronicle_core::failure::{FailureFilter, FailureLedger};
/// use chronicle_postgres::PostgresFailureLedger;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let ledger = PostgresFailureLedger::new(pool);
///
/// let open = ledger.list(FailureFilter::unresolved_for("event_type_counts")).await?;
/// println!("Blocking failures: {}", open.len());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresFailureLedger {
    pool: PgPool,
}

impl PostgresFailureLedger {
    /// Create a ledger over `pool`.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl FailureLedger for PostgresFailureLedger {
    fn record_failure<'a>(
        &'a self,
        projection_name: &'a str,
        event: &'a RecordedEvent,
        error_message: &'a str,
    ) -> BoxFuture<'a, Result<ProcessingFailure>> {
        Box::pin(async move {
            let global_sequence = i64::try_from(event.global_sequence.value())
                .map_err(|e| ProjectionError::Storage(e.to_string()))?;
            let query = format!(
                "INSERT INTO processing_failures (
                     projection_name, event_id, global_sequence, stream_id, event_type, error_message
                 ) VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (projection_name, event_id) DO UPDATE SET
                     attempt_count = processing_failures.attempt_count + 1,
                     error_message = EXCLUDED.error_message,
                     last_failed_at = now(),
                     resolved_at = NULL,
                     resolved_by = NULL,
                     resolution_action = NULL
                 RETURNING {FAILURE_COLUMNS}"
            );
            let row = sqlx::query(&query)
                .bind(projection_name)
                .bind(event.id.as_uuid())
                .bind(global_sequence)
                .bind(event.stream_id.as_str())
                .bind(&event.event_type)
                .bind(error_message)
                .fetch_one(&self.pool)
                .await
                .map_err(storage)?;
            let failure = failure_from_row(&row)?;

            tracing::warn!(
                failure_id = failure.id.value(),
                projection = projection_name,
                global_sequence = event.global_sequence.value(),
                event_type = %event.event_type,
                attempt_count = failure.attempt_count,
                error = error_message,
                "Projection failure recorded"
            );
            metrics::counter!(
                "chronicle.failures.recorded",
                "projection" => projection_name.to_string()
            )
            .increment(1);

            Ok(failure)
        })
    }

    fn get(&self, id: FailureId) -> BoxFuture<'_, Result<Option<ProcessingFailure>>> {
        Box::pin(async move {
            let query = format!("SELECT {FAILURE_COLUMNS} FROM processing_failures WHERE id = $1");
            let row = sqlx::query(&query)
                .bind(id.value())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
            row.as_ref().map(failure_from_row).transpose()
        })
    }

    fn resolve<'a>(
        &'a self,
        id: FailureId,
        resolved_by: &'a str,
        action: ResolutionAction,
    ) -> BoxFuture<'a, Result<ProcessingFailure>> {
        Box::pin(async move {
            let query = format!(
                "UPDATE processing_failures SET
                     resolved_at = CASE WHEN $3 = 'retry' THEN NULL ELSE now() END,
                     resolved_by = $2,
                     resolution_action = $3
                 WHERE id = $1
                 RETURNING {FAILURE_COLUMNS}"
            );
            let row = sqlx::query(&query)
                .bind(id.value())
                .bind(resolved_by)
                .bind(action.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?
                .ok_or_else(|| ProjectionError::NotFound(format!("failure {id}")))?;
            let failure = failure_from_row(&row)?;

            tracing::info!(
                failure_id = id.value(),
                projection = %failure.projection_name,
                resolved_by = resolved_by,
                action = action.as_str(),
                "Projection failure resolved"
            );
            metrics::counter!("chronicle.failures.resolved", "action" => action.as_str())
                .increment(1);

            Ok(failure)
        })
    }

    fn mark_recovered<'a>(
        &'a self,
        projection_name: &'a str,
        event_id: EventId,
    ) -> BoxFuture<'a, Result<Option<ProcessingFailure>>> {
        Box::pin(async move {
            let query = format!(
                "UPDATE processing_failures SET
                     resolved_at = now(),
                     resolved_by = $3,
                     resolution_action = 'retry'
                 WHERE projection_name = $1 AND event_id = $2 AND resolved_at IS NULL
                 RETURNING {FAILURE_COLUMNS}"
            );
            let row = sqlx::query(&query)
                .bind(projection_name)
                .bind(event_id.as_uuid())
                .bind(RECOVERY_RESOLVER)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
            let failure = row.as_ref().map(failure_from_row).transpose()?;

            if let Some(failure) = &failure {
                tracing::info!(
                    failure_id = failure.id.value(),
                    projection = projection_name,
                    attempt_count = failure.attempt_count,
                    "Projection recovered from failure"
                );
            }
            Ok(failure)
        })
    }

    fn list(&self, filter: FailureFilter) -> BoxFuture<'_, Result<Vec<ProcessingFailure>>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {FAILURE_COLUMNS} FROM processing_failures
                  WHERE ($1::text IS NULL OR projection_name = $1)
                    AND ($2::boolean IS NULL OR (resolved_at IS NOT NULL) = $2)
                  ORDER BY last_failed_at DESC, id DESC
                  LIMIT $3"
            );
            let limit = i64::try_from(filter.effective_limit()).unwrap_or(i64::MAX);
            let rows = sqlx::query(&query)
                .bind(filter.projection_name.as_deref())
                .bind(filter.resolved)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(storage)?;
            rows.iter().map(failure_from_row).collect()
        })
    }

    fn count_unresolved<'a>(
        &'a self,
        projection_name: Option<&'a str>,
    ) -> BoxFuture<'a, Result<u64>> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM processing_failures
                  WHERE resolved_at IS NULL AND ($1::text IS NULL OR projection_name = $1)",
            )
            .bind(projection_name)
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
    }
}
