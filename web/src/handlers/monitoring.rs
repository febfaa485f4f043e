//! Monitoring endpoints, mounted under `/api/monitoring`.
//!
//! Read endpoints expose the store head, projection progress and the failure
//! ledger. The two write endpoints, rebuild and resolve, go through the
//! coordinator so they take the projection lease like a worker would.

use crate::error::AppError;
use crate::state::AppState;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use chronicle_core::event::{GlobalSequence, RecordedEvent};
use chronicle_core::failure::{FailureFilter, FailureId, ProcessingFailure, ResolutionAction};
use chronicle_core::statistics::{EventStatistics, RecentEventsQuery, StatisticsQuery, TimeBucket};
use chronicle_projections::{Overview, ProjectionOverview, RebuildTicket};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resolver recorded when a resolve request names nobody.
pub const DEFAULT_RESOLVER: &str = "operator";

/// `GET /overview`
///
/// # Errors
///
/// Returns 503 if storage is unreachable.
pub async fn overview(State(state): State<AppState>) -> Result<Json<Overview>, AppError> {
    Ok(Json(state.coordinator.overview().await?))
}

/// Query string of `GET /statistics`.
#[derive(Debug, Default, Deserialize)]
pub struct StatisticsParams {
    /// `minute`, `hour` (default) or `day`.
    pub bucket: Option<String>,
    /// Inclusive lower bound (RFC 3339).
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound (RFC 3339).
    pub until: Option<DateTime<Utc>>,
}

/// `GET /statistics?bucket=&since=&until=`
///
/// # Errors
///
/// - 422 for an unknown bucket or an empty window
/// - 503 if storage is unreachable
pub async fn statistics(
    State(state): State<AppState>,
    Query(params): Query<StatisticsParams>,
) -> Result<Json<EventStatistics>, AppError> {
    let bucket = match params.bucket.as_deref() {
        None => TimeBucket::default(),
        Some(raw) => raw.parse().map_err(AppError::validation)?,
    };
    if let (Some(since), Some(until)) = (params.since, params.until) {
        if since >= until {
            return Err(AppError::validation("`since` must be before `until`"));
        }
    }

    let query = StatisticsQuery {
        bucket,
        since: params.since,
        until: params.until,
    };
    Ok(Json(state.events.statistics(query).await?))
}

/// Query string of `GET /recent-events`.
#[derive(Debug, Default, Deserialize)]
pub struct RecentEventsParams {
    /// Only events of this type.
    pub event_type: Option<String>,
    /// Only events of streams of this type.
    pub stream_type: Option<String>,
    /// Cursor: only events below this global sequence.
    pub before: Option<u64>,
    /// Page size, clamped to `1..=500`.
    pub limit: Option<usize>,
}

/// One event as shown by the monitoring API.
///
/// Payloads are opaque bytes; they are inlined when they happen to be JSON.
#[derive(Debug, Serialize)]
pub struct EventView {
    /// Event id.
    pub event_id: String,
    /// Position in the log.
    pub global_sequence: u64,
    /// Stream of the event.
    pub stream_id: String,
    /// Type of the stream.
    pub stream_type: String,
    /// Position in the stream.
    pub sequence: u64,
    /// Event type.
    pub event_type: String,
    /// Payload size in bytes.
    pub payload_bytes: usize,
    /// Payload, when it parses as JSON.
    pub payload: Option<serde_json::Value>,
    /// Event metadata.
    pub metadata: serde_json::Value,
    /// Append time.
    pub recorded_at: DateTime<Utc>,
}

impl From<RecordedEvent> for EventView {
    fn from(event: RecordedEvent) -> Self {
        Self {
            event_id: event.id.to_string(),
            global_sequence: event.global_sequence.value(),
            stream_id: event.stream_id.into_inner(),
            stream_type: event.stream_type.as_str().to_string(),
            sequence: event.sequence.value(),
            payload_bytes: event.payload.len(),
            payload: serde_json::from_slice(&event.payload).ok(),
            metadata: event.metadata.to_json(),
            event_type: event.event_type,
            recorded_at: event.recorded_at,
        }
    }
}

/// Body of `GET /recent-events`.
#[derive(Debug, Serialize)]
pub struct RecentEventsResponse {
    /// Events, newest first.
    pub events: Vec<EventView>,
    /// Pass as `before` to fetch the next page; absent on the last page.
    pub next_before: Option<u64>,
}

/// `GET /recent-events?event_type=&stream_type=&before=&limit=`
///
/// # Errors
///
/// Returns 503 if storage is unreachable.
pub async fn recent_events(
    State(state): State<AppState>,
    Query(params): Query<RecentEventsParams>,
) -> Result<Json<RecentEventsResponse>, AppError> {
    let query = RecentEventsQuery {
        event_type: params.event_type,
        stream_type: params.stream_type,
        before: params.before.map(GlobalSequence::new),
        limit: params.limit.unwrap_or(RecentEventsQuery::DEFAULT_LIMIT),
    };
    let page = state.events.recent_events(query).await?;

    Ok(Json(RecentEventsResponse {
        events: page.events.into_iter().map(EventView::from).collect(),
        next_before: page.next_before.map(GlobalSequence::value),
    }))
}

/// `GET /projections`
///
/// # Errors
///
/// Returns 503 if storage is unreachable.
pub async fn projections(
    State(state): State<AppState>,
) -> Result<Json<Vec<ProjectionOverview>>, AppError> {
    Ok(Json(state.coordinator.projections().await?))
}

/// `GET /projections/{name}`
///
/// # Errors
///
/// Returns 404 for an unknown projection.
pub async fn projection(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ProjectionOverview>, AppError> {
    Ok(Json(state.coordinator.projection(&name).await?))
}

/// `POST /projections/{name}/rebuild`
///
/// Resets the projection and returns immediately; its worker replays the log
/// up to the returned target.
///
/// # Errors
///
/// - 404 for an unknown projection
/// - 409 while a worker holds the projection's lease
pub async fn rebuild_projection(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<(StatusCode, Json<RebuildTicket>), AppError> {
    let ticket = state.coordinator.rebuild_projection(&name).await?;
    tracing::info!(
        projection = %ticket.projection,
        target = ticket.target.value(),
        "Rebuild requested"
    );
    Ok((StatusCode::ACCEPTED, Json(ticket)))
}

/// Query string of `GET /failures`.
#[derive(Debug, Default, Deserialize)]
pub struct FailureParams {
    /// Only failures of this projection.
    pub projection: Option<String>,
    /// Only resolved (`true`) or unresolved (`false`) failures.
    pub resolved: Option<bool>,
    /// Page size, at most 500.
    pub limit: Option<usize>,
}

/// `GET /failures?projection=&resolved=&limit=`
///
/// # Errors
///
/// Returns 503 if storage is unreachable.
pub async fn list_failures(
    State(state): State<AppState>,
    Query(params): Query<FailureParams>,
) -> Result<Json<Vec<ProcessingFailure>>, AppError> {
    let filter = FailureFilter {
        projection_name: params.projection,
        resolved: params.resolved,
        limit: params.limit,
    };
    Ok(Json(state.coordinator.list_failures(filter).await?))
}

/// `GET /failures/{id}`
///
/// # Errors
///
/// Returns 404 if there is no such failure.
pub async fn get_failure(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ProcessingFailure>, AppError> {
    Ok(Json(state.coordinator.get_failure(FailureId::new(id)).await?))
}

/// Body of `POST /failures/{id}/resolve`.
#[derive(Debug, Deserialize)]
pub struct ResolveRequest {
    /// `retry`, `skip` or `ignore`.
    pub action: String,
    /// Who is resolving; defaults to [`DEFAULT_RESOLVER`].
    pub resolver: Option<String>,
}

/// `POST /failures/{id}/resolve`
///
/// # Errors
///
/// - 404 if there is no such failure
/// - 409 if it is already resolved, not blocking, or the lease is held
/// - 422 for an unknown action
pub async fn resolve_failure(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<ResolveRequest>,
) -> Result<Json<ProcessingFailure>, AppError> {
    let action: ResolutionAction = request
        .action
        .parse()
        .map_err(|e: chronicle_core::projection::ProjectionError| {
            AppError::validation(e.to_string())
        })?;
    let resolver = request
        .resolver
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_RESOLVER);

    let failure = state
        .coordinator
        .resolve_failure(FailureId::new(id), resolver, action)
        .await?;
    Ok(Json(failure))
}
