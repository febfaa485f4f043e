//! Read-only queries over the event log for the monitoring surface.
//!
//! Statistics are bucketed counts of events by `(event_type, stream_type)`;
//! recent events are a most-recent-first page keyed by global sequence.

use crate::BoxFuture;
use crate::event::{GlobalSequence, RecordedEvent};
use crate::event_store::EventStoreError;
use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Width of a statistics bucket.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeBucket {
    /// One-minute buckets.
    Minute,
    /// One-hour buckets.
    #[default]
    Hour,
    /// One-day buckets (UTC).
    Day,
}

impl TimeBucket {
    /// Name used in query strings and by `date_trunc`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
        }
    }

    /// Bucket width as a duration.
    #[must_use]
    pub fn duration(self) -> Duration {
        match self {
            Self::Minute => Duration::minutes(1),
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::days(1),
        }
    }

    /// Round `at` down to the start of its bucket.
    #[must_use]
    pub fn truncate(self, at: DateTime<Utc>) -> DateTime<Utc> {
        at.duration_trunc(self.duration()).unwrap_or(at)
    }
}

impl fmt::Display for TimeBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeBucket {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minute" => Ok(Self::Minute),
            "hour" => Ok(Self::Hour),
            "day" => Ok(Self::Day),
            other => Err(format!("unknown bucket '{other}', expected minute, hour or day")),
        }
    }
}

/// Parameters for [`EventLogQueries::statistics`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsQuery {
    /// Bucket width.
    #[serde(default)]
    pub bucket: TimeBucket,
    /// Inclusive lower bound on `recorded_at`.
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `recorded_at`.
    pub until: Option<DateTime<Utc>>,
}

impl StatisticsQuery {
    /// Whether `at` falls inside the query window.
    #[must_use]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.since.is_none_or(|since| at >= since) && self.until.is_none_or(|until| at < until)
    }
}

/// Number of events of one `(event_type, stream_type)` pair in one bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCount {
    /// Start of the bucket.
    pub bucket_start: DateTime<Utc>,
    /// Event type.
    pub event_type: String,
    /// Stream type.
    pub stream_type: String,
    /// Number of events.
    pub count: u64,
}

/// Result of a statistics query.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStatistics {
    /// Bucket width used.
    pub bucket: TimeBucket,
    /// Counts ordered by bucket start, then event type, then stream type.
    pub buckets: Vec<BucketCount>,
    /// Total per event type across all buckets.
    pub totals_by_event_type: BTreeMap<String, u64>,
    /// Total per stream type across all buckets.
    pub totals_by_stream_type: BTreeMap<String, u64>,
    /// Total events in the window.
    pub total: u64,
}

impl EventStatistics {
    /// Build statistics from bucket counts, computing the totals.
    #[must_use]
    pub fn from_counts(bucket: TimeBucket, mut buckets: Vec<BucketCount>) -> Self {
        buckets.sort_by(|a, b| {
            (a.bucket_start, &a.event_type, &a.stream_type).cmp(&(
                b.bucket_start,
                &b.event_type,
                &b.stream_type,
            ))
        });

        let mut totals_by_event_type = BTreeMap::new();
        let mut totals_by_stream_type = BTreeMap::new();
        let mut total = 0;
        for count in &buckets {
            *totals_by_event_type
                .entry(count.event_type.clone())
                .or_insert(0) += count.count;
            *totals_by_stream_type
                .entry(count.stream_type.clone())
                .or_insert(0) += count.count;
            total += count.count;
        }

        Self {
            bucket,
            buckets,
            totals_by_event_type,
            totals_by_stream_type,
            total,
        }
    }

    /// Aggregate recorded events into buckets.
    ///
    /// Used by stores that cannot push the grouping down to storage.
    #[must_use]
    pub fn from_events<'a>(
        query: &StatisticsQuery,
        events: impl IntoIterator<Item = &'a RecordedEvent>,
    ) -> Self {
        let mut counts: BTreeMap<(DateTime<Utc>, String, String), u64> = BTreeMap::new();
        for event in events {
            if !query.contains(event.recorded_at) {
                continue;
            }
            let key = (
                query.bucket.truncate(event.recorded_at),
                event.event_type.clone(),
                event.stream_type.as_str().to_string(),
            );
            *counts.entry(key).or_insert(0) += 1;
        }

        let buckets = counts
            .into_iter()
            .map(|((bucket_start, event_type, stream_type), count)| BucketCount {
                bucket_start,
                event_type,
                stream_type,
                count,
            })
            .collect();
        Self::from_counts(query.bucket, buckets)
    }
}

/// Parameters for [`EventLogQueries::recent_events`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentEventsQuery {
    /// Only events of this type.
    pub event_type: Option<String>,
    /// Only events of streams of this type.
    pub stream_type: Option<String>,
    /// Only events with `global_sequence < before` (cursor).
    pub before: Option<GlobalSequence>,
    /// Page size, clamped to `1..=MAX_LIMIT`.
    pub limit: usize,
}

impl RecentEventsQuery {
    /// Default page size.
    pub const DEFAULT_LIMIT: usize = 50;
    /// Largest page size accepted.
    pub const MAX_LIMIT: usize = 500;

    /// The page size actually used.
    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit.clamp(1, Self::MAX_LIMIT)
    }

    /// Whether `event` passes the filters (cursor included).
    #[must_use]
    pub fn matches(&self, event: &RecordedEvent) -> bool {
        self.event_type
            .as_deref()
            .is_none_or(|t| t == event.event_type)
            && self
                .stream_type
                .as_deref()
                .is_none_or(|t| t == event.stream_type.as_str())
            && self.before.is_none_or(|b| event.global_sequence < b)
    }
}

impl Default for RecentEventsQuery {
    fn default() -> Self {
        Self {
            event_type: None,
            stream_type: None,
            before: None,
            limit: Self::DEFAULT_LIMIT,
        }
    }
}

/// One page of recent events.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecentEventsPage {
    /// Events, highest global sequence first.
    pub events: Vec<RecordedEvent>,
    /// Cursor for the next page, absent on the last page.
    pub next_before: Option<GlobalSequence>,
}

impl RecentEventsPage {
    /// Build a page from up to `limit + 1` events fetched newest first.
    ///
    /// The extra event only signals that another page exists.
    #[must_use]
    pub fn from_overfetch(mut events: Vec<RecordedEvent>, limit: usize) -> Self {
        let has_more = events.len() > limit;
        events.truncate(limit);
        let next_before = if has_more {
            events.last().map(|e| e.global_sequence)
        } else {
            None
        };
        Self {
            events,
            next_before,
        }
    }
}

/// Monitoring queries over the event log.
pub trait EventLogQueries: Send + Sync {
    /// Time-bucketed counts by `(event_type, stream_type)`.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` on storage failures.
    fn statistics(
        &self,
        query: StatisticsQuery,
    ) -> BoxFuture<'_, Result<EventStatistics, EventStoreError>>;

    /// Most-recent-first page of events.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` or `Serialization` on storage failures.
    fn recent_events(
        &self,
        query: RecentEventsQuery,
    ) -> BoxFuture<'_, Result<RecentEventsPage, EventStoreError>>;
}
