//! In-memory event store.
//!
//! Every append runs inside one write-lock critical section, which serializes
//! global sequence allocation the same way the Postgres head row does.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use chronicle_core::BoxFuture;
use chronicle_core::environment::{Clock, SystemClock};
use chronicle_core::event::{EventId, GlobalSequence, NewEvent, RecordedEvent};
use chronicle_core::event_store::{
    AppendLimits, AppendResult, EventStore, EventStoreError, validate_append,
};
use chronicle_core::statistics::{
    EventLogQueries, EventStatistics, RecentEventsPage, RecentEventsQuery, StatisticsQuery,
};
use chronicle_core::stream::{Stream, StreamId, StreamRegistry, StreamType, Version};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct Log {
    /// Event with global sequence `n` lives at index `n - 1`.
    events: Vec<RecordedEvent>,
    streams: HashMap<StreamId, Stream>,
    stream_index: HashMap<StreamId, Vec<usize>>,
}

/// In-memory event store for fast, deterministic testing.
///
/// Implements [`EventStore`], [`StreamRegistry`] and [`EventLogQueries`].
/// Clones share the same log.
///
/// # Example
///
/// ```
/// use chronicle_testing::InMemoryEventStore;
/// use chronicle_core::event::NewEvent;
/// use chronicle_core::event_store::EventStore;
/// use chronicle_core::stream::{StreamId, StreamType, Version};
///
/// # tokio_test::block_on(async {
/// let store = InMemoryEventStore::new();
/// let result = store
///     .append(
///         StreamId::new("ticket-42"),
///         StreamType::new("ticket"),
///         Version::INITIAL,
///         vec![NewEvent::new("TicketReserved.v1", vec![1])],
///     )
///     .await
///     .unwrap();
/// assert_eq!(result.version, Version::new(1));
/// # });
/// ```
#[derive(Clone)]
pub struct InMemoryEventStore {
    log: Arc<RwLock<Log>>,
    limits: AppendLimits,
    clock: Arc<dyn Clock>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryEventStore {
    /// Create an empty store with default limits and the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            log: Arc::new(RwLock::new(Log::default())),
            limits: AppendLimits::default(),
            clock: Arc::new(SystemClock),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Use custom append limits.
    #[must_use]
    pub fn with_limits(mut self, limits: AppendLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Stamp `recorded_at` with `clock`.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Make every subsequent call fail with `StorageUnavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of events stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.read().unwrap().events.len()
    }

    /// Whether no event has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every stored event, in global order.
    #[must_use]
    pub fn all_events(&self) -> Vec<RecordedEvent> {
        self.log.read().unwrap().events.clone()
    }

    fn check_available(&self) -> Result<(), EventStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EventStoreError::StorageUnavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn append_locked(
        &self,
        stream_id: StreamId,
        stream_type: StreamType,
        expected_version: Version,
        events: Vec<NewEvent>,
    ) -> Result<AppendResult, EventStoreError> {
        validate_append(&stream_id, &stream_type, &events, &self.limits)?;
        self.check_available()?;

        let now = self.clock.now();
        let mut log = self.log.write().unwrap();

        let (current_version, created_at) = match log.streams.get(&stream_id) {
            Some(stream) => {
                if stream.stream_type != stream_type {
                    return Err(EventStoreError::Validation(format!(
                        "stream {stream_id} has type {}, not {stream_type}",
                        stream.stream_type
                    )));
                }
                (stream.current_version, stream.created_at)
            }
            None => (Version::INITIAL, now),
        };

        if current_version != expected_version {
            return Err(EventStoreError::ConcurrencyConflict {
                stream_id,
                expected: expected_version,
                actual: current_version,
            });
        }

        let first_global_sequence = GlobalSequence::new(log.events.len() as u64 + 1);
        let mut version = current_version;
        for event in events {
            version = version.next();
            let index = log.events.len();
            let recorded = RecordedEvent {
                id: EventId::generate(),
                stream_id: stream_id.clone(),
                stream_type: stream_type.clone(),
                sequence: version,
                global_sequence: GlobalSequence::new(index as u64 + 1),
                event_type: event.event_type,
                payload: event.payload,
                metadata: event.metadata,
                recorded_at: now,
            };
            log.events.push(recorded);
            log.stream_index
                .entry(stream_id.clone())
                .or_default()
                .push(index);
        }
        let last_global_sequence = GlobalSequence::new(log.events.len() as u64);

        log.streams.insert(
            stream_id.clone(),
            Stream {
                stream_id: stream_id.clone(),
                stream_type,
                current_version: version,
                created_at,
                updated_at: now,
            },
        );

        Ok(AppendResult {
            stream_id,
            version,
            first_global_sequence,
            last_global_sequence,
        })
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventStore")
            .field("events", &self.len())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        stream_id: StreamId,
        stream_type: StreamType,
        expected_version: Version,
        events: Vec<NewEvent>,
    ) -> BoxFuture<'_, Result<AppendResult, EventStoreError>> {
        Box::pin(async move {
            self.append_locked(stream_id, stream_type, expected_version, events)
        })
    }

    fn read_stream(
        &self,
        stream_id: StreamId,
        from_version: Version,
    ) -> BoxFuture<'_, Result<Vec<RecordedEvent>, EventStoreError>> {
        Box::pin(async move {
            self.check_available()?;
            let log = self.log.read().unwrap();
            let Some(indexes) = log.stream_index.get(&stream_id) else {
                return Ok(Vec::new());
            };
            Ok(indexes
                .iter()
                .map(|&i| &log.events[i])
                .filter(|e| e.sequence >= from_version)
                .cloned()
                .collect())
        })
    }

    fn read_all(
        &self,
        after: GlobalSequence,
        batch_size: usize,
    ) -> BoxFuture<'_, Result<Vec<RecordedEvent>, EventStoreError>> {
        Box::pin(async move {
            self.check_available()?;
            let log = self.log.read().unwrap();
            let start = usize::try_from(after.value())
                .unwrap_or(usize::MAX)
                .min(log.events.len());
            let end = start.saturating_add(batch_size).min(log.events.len());
            Ok(log.events[start..end].to_vec())
        })
    }

    fn head(&self) -> BoxFuture<'_, Result<GlobalSequence, EventStoreError>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(GlobalSequence::new(self.log.read().unwrap().events.len() as u64))
        })
    }
}

impl StreamRegistry for InMemoryEventStore {
    fn get_or_create(
        &self,
        stream_id: StreamId,
        stream_type: StreamType,
    ) -> BoxFuture<'_, Result<Stream, EventStoreError>> {
        Box::pin(async move {
            self.check_available()?;
            if stream_id.as_str().is_empty() || stream_type.as_str().is_empty() {
                return Err(EventStoreError::Validation(
                    "stream_id and stream_type cannot be empty".to_string(),
                ));
            }
            let now = self.clock.now();
            let mut log = self.log.write().unwrap();
            let stream = log
                .streams
                .entry(stream_id.clone())
                .or_insert_with(|| Stream {
                    stream_id,
                    stream_type: stream_type.clone(),
                    current_version: Version::INITIAL,
                    created_at: now,
                    updated_at: now,
                });
            if stream.stream_type != stream_type {
                return Err(EventStoreError::Validation(format!(
                    "stream {} has type {}, not {stream_type}",
                    stream.stream_id, stream.stream_type
                )));
            }
            Ok(stream.clone())
        })
    }

    fn get_stream(
        &self,
        stream_id: StreamId,
    ) -> BoxFuture<'_, Result<Option<Stream>, EventStoreError>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.log.read().unwrap().streams.get(&stream_id).cloned())
        })
    }

    fn stream_count(&self) -> BoxFuture<'_, Result<u64, EventStoreError>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.log.read().unwrap().stream_index.len() as u64)
        })
    }
}

impl EventLogQueries for InMemoryEventStore {
    fn statistics(
        &self,
        query: StatisticsQuery,
    ) -> BoxFuture<'_, Result<EventStatistics, EventStoreError>> {
        Box::pin(async move {
            self.check_available()?;
            let log = self.log.read().unwrap();
            Ok(EventStatistics::from_events(&query, &log.events))
        })
    }

    fn recent_events(
        &self,
        query: RecentEventsQuery,
    ) -> BoxFuture<'_, Result<RecentEventsPage, EventStoreError>> {
        Box::pin(async move {
            self.check_available()?;
            let limit = query.effective_limit();
            let log = self.log.read().unwrap();
            let events = log
                .events
                .iter()
                .rev()
                .filter(|e| query.matches(e))
                .take(limit + 1)
                .cloned()
                .collect();
            Ok(RecentEventsPage::from_overfetch(events, limit))
        })
    }
}
