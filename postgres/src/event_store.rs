//! `PostgreSQL` event store.
//!
//! # Append transaction
//!
//! ```text
//! BEGIN
//!   INSERT event_streams ... ON CONFLICT DO NOTHING      -- implicit creation
//!   SELECT ... FROM event_streams ... FOR UPDATE         -- per-stream lock
//!   check stream_type and expected_version
//!   UPDATE event_store_head SET global_sequence += n     -- global lock, gapless
//!   INSERT events (sequence, global_sequence) ...
//!   UPDATE event_streams SET current_version = ...
//! COMMIT
//! ```
//!
//! Any error drops the transaction, so nothing is committed: no event, no
//! version bump and no consumed global sequence.

use crate::{i64_to_u64, storage_error, u64_to_i64};
use chronicle_core::BoxFuture;
use chronicle_core::event::{EventId, EventMetadata, GlobalSequence, NewEvent, RecordedEvent};
use chronicle_core::event_store::{
    AppendLimits, AppendResult, EventStore, EventStoreError, validate_append,
};
use chronicle_core::statistics::{
    BucketCount, EventLogQueries, EventStatistics, RecentEventsPage, RecentEventsQuery,
    StatisticsQuery,
};
use chronicle_core::stream::{Stream, StreamId, StreamRegistry, StreamType, Version};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::time::Instant;
use uuid::Uuid;

const EVENT_COLUMNS: &str = "event_id, stream_id, stream_type, sequence, global_sequence, \
                             event_type, payload, metadata, recorded_at";

const STREAM_COLUMNS: &str = "stream_id, stream_type, current_version, created_at, updated_at";

/// Why an append transaction aborted.
enum AppendFailure {
    Rejected(EventStoreError),
    /// A concurrent writer took the same `(stream_id, sequence)` slot.
    UniqueViolation,
}

impl From<EventStoreError> for AppendFailure {
    fn from(error: EventStoreError) -> Self {
        Self::Rejected(error)
    }
}

fn insert_error(error: sqlx::Error) -> AppendFailure {
    let unique = error
        .as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == "23505");
    if unique {
        AppendFailure::UniqueViolation
    } else {
        AppendFailure::Rejected(storage_error(error))
    }
}

/// PostgreSQL-backed event store, stream registry and monitoring queries.
///
/// # Example
///
/// ```no_run
/// use chronicle_postgres::PostgresEventStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresEventStore::new("postgres://localhost/chronicle").await?;
/// chronicle_postgres::migrate(store.pool()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresEventStore {
    pool: PgPool,
    limits: AppendLimits,
}

impl PostgresEventStore {
    /// Connect to `database_url` with a default pool.
    ///
    /// # Errors
    ///
    /// Returns [`EventStoreError::StorageUnavailable`] if the connection fails.
    pub async fn new(database_url: &str) -> Result<Self, EventStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| EventStoreError::StorageUnavailable(format!("Failed to connect: {e}")))?;
        Ok(Self::from_pool(pool))
    }

    /// Use an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            limits: AppendLimits::default(),
        }
    }

    /// Replace the append limits.
    #[must_use]
    pub const fn with_limits(mut self, limits: AppendLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn append_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        stream_id: &StreamId,
        stream_type: &StreamType,
        expected_version: Version,
        events: &[NewEvent],
    ) -> Result<AppendResult, AppendFailure> {
        sqlx::query(
            "INSERT INTO event_streams (stream_id, stream_type) VALUES ($1, $2)
             ON CONFLICT (stream_id) DO NOTHING",
        )
        .bind(stream_id.as_str())
        .bind(stream_type.as_str())
        .execute(&mut **tx)
        .await
        .map_err(insert_error)?;

        let (existing_type, current): (String, i64) = sqlx::query_as(
            "SELECT stream_type, current_version FROM event_streams WHERE stream_id = $1 FOR UPDATE",
        )
        .bind(stream_id.as_str())
        .fetch_one(&mut **tx)
        .await
        .map_err(storage_error)?;

        if existing_type != stream_type.as_str() {
            return Err(EventStoreError::Validation(format!(
                "stream {stream_id} has type '{existing_type}', not '{stream_type}'"
            ))
            .into());
        }
        let actual = Version::new(i64_to_u64(current)?);
        if actual != expected_version {
            return Err(EventStoreError::ConcurrencyConflict {
                stream_id: stream_id.clone(),
                expected: expected_version,
                actual,
            }
            .into());
        }

        let count = u64::try_from(events.len())
            .map_err(|_| EventStoreError::Validation("batch too large".to_string()))?;
        let (last,): (i64,) = sqlx::query_as(
            "UPDATE event_store_head SET global_sequence = global_sequence + $1
             RETURNING global_sequence",
        )
        .bind(u64_to_i64(count)?)
        .fetch_one(&mut **tx)
        .await
        .map_err(storage_error)?;
        let last_global = i64_to_u64(last)?;
        let first_global = last_global + 1 - count;

        for (offset, event) in (0_u64..).zip(events) {
            sqlx::query(
                "INSERT INTO events (event_id, stream_id, stream_type, sequence, global_sequence,
                                     event_type, payload, metadata)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(EventId::generate().as_uuid())
            .bind(stream_id.as_str())
            .bind(stream_type.as_str())
            .bind(u64_to_i64(actual.value() + offset + 1)?)
            .bind(u64_to_i64(first_global + offset)?)
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(event.metadata.to_json())
            .execute(&mut **tx)
            .await
            .map_err(insert_error)?;
        }

        let version = actual + count;
        sqlx::query(
            "UPDATE event_streams SET current_version = $2, updated_at = now() WHERE stream_id = $1",
        )
        .bind(stream_id.as_str())
        .bind(u64_to_i64(version.value())?)
        .execute(&mut **tx)
        .await
        .map_err(storage_error)?;

        Ok(AppendResult {
            stream_id: stream_id.clone(),
            version,
            first_global_sequence: GlobalSequence::new(first_global),
            last_global_sequence: GlobalSequence::new(last_global),
        })
    }

    async fn current_version(&self, stream_id: &StreamId) -> Result<Version, EventStoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT current_version FROM event_streams WHERE stream_id = $1")
                .bind(stream_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_error)?;
        Ok(Version::new(row.map_or(Ok(0), |(v,)| i64_to_u64(v))?))
    }
}

fn event_from_row(row: &PgRow) -> Result<RecordedEvent, EventStoreError> {
    let read =
        |e: sqlx::Error| EventStoreError::Serialization(format!("Failed to decode event: {e}"));
    let id: Uuid = row.try_get("event_id").map_err(read)?;
    let stream_id: String = row.try_get("stream_id").map_err(read)?;
    let stream_type: String = row.try_get("stream_type").map_err(read)?;
    let sequence: i64 = row.try_get("sequence").map_err(read)?;
    let global_sequence: i64 = row.try_get("global_sequence").map_err(read)?;
    let metadata: serde_json::Value = row.try_get("metadata").map_err(read)?;

    Ok(RecordedEvent {
        id: EventId::from_uuid(id),
        stream_id: StreamId::new(stream_id),
        stream_type: StreamType::new(stream_type),
        sequence: Version::new(i64_to_u64(sequence)?),
        global_sequence: GlobalSequence::new(i64_to_u64(global_sequence)?),
        event_type: row.try_get("event_type").map_err(read)?,
        payload: row.try_get("payload").map_err(read)?,
        metadata: EventMetadata::from_json(&metadata)
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?,
        recorded_at: row.try_get("recorded_at").map_err(read)?,
    })
}

fn stream_from_row(row: &PgRow) -> Result<Stream, EventStoreError> {
    let read =
        |e: sqlx::Error| EventStoreError::Serialization(format!("Failed to decode stream: {e}"));
    let stream_id: String = row.try_get("stream_id").map_err(read)?;
    let stream_type: String = row.try_get("stream_type").map_err(read)?;
    let current_version: i64 = row.try_get("current_version").map_err(read)?;

    Ok(Stream {
        stream_id: StreamId::new(stream_id),
        stream_type: StreamType::new(stream_type),
        current_version: Version::new(i64_to_u64(current_version)?),
        created_at: row.try_get("created_at").map_err(read)?,
        updated_at: row.try_get("updated_at").map_err(read)?,
    })
}

impl EventStore for PostgresEventStore {
    fn append(
        &self,
        stream_id: StreamId,
        stream_type: StreamType,
        expected_version: Version,
        events: Vec<NewEvent>,
    ) -> BoxFuture<'_, Result<AppendResult, EventStoreError>> {
        Box::pin(async move {
            validate_append(&stream_id, &stream_type, &events, &self.limits)?;
            let started = Instant::now();

            let mut tx = self.pool.begin().await.map_err(storage_error)?;
            let outcome = self
                .append_in_tx(&mut tx, &stream_id, &stream_type, expected_version, &events)
                .await;
            let result = match outcome {
                Ok(result) => tx.commit().await.map(|()| result).map_err(storage_error),
                Err(AppendFailure::Rejected(error)) => Err(error),
                Err(AppendFailure::UniqueViolation) => {
                    drop(tx);
                    Err(EventStoreError::ConcurrencyConflict {
                        stream_id: stream_id.clone(),
                        expected: expected_version,
                        actual: self.current_version(&stream_id).await?,
                    })
                }
            };

            match result {
                Ok(result) => {
                    metrics::counter!(
                        "chronicle.events.appended",
                        "stream_type" => stream_type.as_str().to_string()
                    )
                    .increment(events.len() as u64);
                    metrics::histogram!("chronicle.append.duration")
                        .record(started.elapsed().as_secs_f64());
                    tracing::debug!(
                        stream_id = %stream_id,
                        version = result.version.value(),
                        first_global_sequence = result.first_global_sequence.value(),
                        last_global_sequence = result.last_global_sequence.value(),
                        "Events appended"
                    );
                    Ok(result)
                }
                Err(EventStoreError::ConcurrencyConflict {
                    stream_id,
                    expected,
                    actual,
                }) => {
                    metrics::counter!("chronicle.append.conflicts").increment(1);
                    tracing::debug!(
                        stream_id = %stream_id,
                        expected = expected.value(),
                        actual = actual.value(),
                        "Append rejected: concurrency conflict"
                    );
                    Err(EventStoreError::ConcurrencyConflict {
                        stream_id,
                        expected,
                        actual,
                    })
                }
                Err(e) => {
                    tracing::error!(stream_id = %stream_id, error = %e, "Append failed");
                    Err(e)
                }
            }
        })
    }

    fn read_stream(
        &self,
        stream_id: StreamId,
        from_version: Version,
    ) -> BoxFuture<'_, Result<Vec<RecordedEvent>, EventStoreError>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {EVENT_COLUMNS} FROM events
                  WHERE stream_id = $1 AND sequence >= $2
                  ORDER BY sequence"
            );
            let rows = sqlx::query(&query)
                .bind(stream_id.as_str())
                .bind(u64_to_i64(from_version.value())?)
                .fetch_all(&self.pool)
                .await
                .map_err(storage_error)?;
            rows.iter().map(event_from_row).collect()
        })
    }

    fn read_all(
        &self,
        after: GlobalSequence,
        batch_size: usize,
    ) -> BoxFuture<'_, Result<Vec<RecordedEvent>, EventStoreError>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {EVENT_COLUMNS} FROM events
                  WHERE global_sequence > $1
                  ORDER BY global_sequence
                  LIMIT $2"
            );
            let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);
            let rows = sqlx::query(&query)
                .bind(u64_to_i64(after.value())?)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(storage_error)?;
            rows.iter().map(event_from_row).collect()
        })
    }

    fn head(&self) -> BoxFuture<'_, Result<GlobalSequence, EventStoreError>> {
        Box::pin(async move {
            let (head,): (i64,) = sqlx::query_as("SELECT global_sequence FROM event_store_head")
                .fetch_one(&self.pool)
                .await
                .map_err(storage_error)?;
            Ok(GlobalSequence::new(i64_to_u64(head)?))
        })
    }
}

impl StreamRegistry for PostgresEventStore {
    fn get_or_create(
        &self,
        stream_id: StreamId,
        stream_type: StreamType,
    ) -> BoxFuture<'_, Result<Stream, EventStoreError>> {
        Box::pin(async move {
            if stream_id.as_str().is_empty() || stream_type.as_str().is_empty() {
                return Err(EventStoreError::Validation(
                    "stream id and stream type must not be empty".to_string(),
                ));
            }

            let query = format!(
                "WITH created AS (
                     INSERT INTO event_streams (stream_id, stream_type) VALUES ($1, $2)
                     ON CONFLICT (stream_id) DO NOTHING
                     RETURNING {STREAM_COLUMNS}
                 )
                 SELECT {STREAM_COLUMNS} FROM created
                 UNION ALL
                 SELECT {STREAM_COLUMNS} FROM event_streams WHERE stream_id = $1
                 LIMIT 1"
            );
            let row = sqlx::query(&query)
                .bind(stream_id.as_str())
                .bind(stream_type.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(storage_error)?;
            let stream = stream_from_row(&row)?;

            if stream.stream_type != stream_type {
                return Err(EventStoreError::Validation(format!(
                    "stream {stream_id} has type '{}', not '{stream_type}'",
                    stream.stream_type
                )));
            }
            Ok(stream)
        })
    }

    fn get_stream(
        &self,
        stream_id: StreamId,
    ) -> BoxFuture<'_, Result<Option<Stream>, EventStoreError>> {
        Box::pin(async move {
            let query = format!("SELECT {STREAM_COLUMNS} FROM event_streams WHERE stream_id = $1");
            let row = sqlx::query(&query)
                .bind(stream_id.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_error)?;
            row.as_ref().map(stream_from_row).transpose()
        })
    }

    fn stream_count(&self) -> BoxFuture<'_, Result<u64, EventStoreError>> {
        Box::pin(async move {
            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM event_streams WHERE current_version > 0")
                    .fetch_one(&self.pool)
                    .await
                    .map_err(storage_error)?;
            i64_to_u64(count)
        })
    }
}

impl EventLogQueries for PostgresEventStore {
    fn statistics(
        &self,
        query: StatisticsQuery,
    ) -> BoxFuture<'_, Result<EventStatistics, EventStoreError>> {
        Box::pin(async move {
            let rows: Vec<(DateTime<Utc>, String, String, i64)> = sqlx::query_as(
                "SELECT date_trunc($1, recorded_at AT TIME ZONE 'UTC') AT TIME ZONE 'UTC' AS bucket_start,
                        event_type, stream_type, COUNT(*) AS count
                   FROM events
                  WHERE ($2::timestamptz IS NULL OR recorded_at >= $2)
                    AND ($3::timestamptz IS NULL OR recorded_at < $3)
                  GROUP BY 1, 2, 3",
            )
            .bind(query.bucket.as_str())
            .bind(query.since)
            .bind(query.until)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

            let buckets = rows
                .into_iter()
                .map(|(bucket_start, event_type, stream_type, count)| {
                    Ok(BucketCount {
                        bucket_start,
                        event_type,
                        stream_type,
                        count: i64_to_u64(count)?,
                    })
                })
                .collect::<Result<Vec<_>, EventStoreError>>()?;

            Ok(EventStatistics::from_counts(query.bucket, buckets))
        })
    }

    fn recent_events(
        &self,
        query: RecentEventsQuery,
    ) -> BoxFuture<'_, Result<RecentEventsPage, EventStoreError>> {
        Box::pin(async move {
            let limit = query.effective_limit();
            let sql = format!(
                "SELECT {EVENT_COLUMNS} FROM events
                  WHERE ($1::text IS NULL OR event_type = $1)
                    AND ($2::text IS NULL OR stream_type = $2)
                    AND ($3::bigint IS NULL OR global_sequence < $3)
                  ORDER BY global_sequence DESC
                  LIMIT $4"
            );
            let before = query
                .before
                .map(|b| u64_to_i64(b.value()))
                .transpose()?;
            let rows = sqlx::query(&sql)
                .bind(query.event_type.as_deref())
                .bind(query.stream_type.as_deref())
                .bind(before)
                .bind(u64_to_i64(limit as u64 + 1)?)
                .fetch_all(&self.pool)
                .await
                .map_err(storage_error)?;

            let events = rows
                .iter()
                .map(event_from_row)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(RecentEventsPage::from_overfetch(events, limit))
        })
    }
}
