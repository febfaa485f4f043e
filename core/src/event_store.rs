//! Event store trait and related types.
//!
//! The event store is an append-only log grouped into streams. It provides:
//!
//! - Atomic multi-event append with optimistic concurrency per stream
//! - A gapless, strictly increasing global sequence across all streams
//! - Ordered, restartable reads by stream and across the whole log
//!
//! Events are never updated or deleted, so the trait exposes no such operation.
//!
//! # Implementations
//!
//! - `PostgresEventStore` (in `chronicle-postgres`): production implementation
//! - `InMemoryEventStore` (in `chronicle-testing`): fast, deterministic testing
//!
//! # Example
//!
//! ```no_run
//! use chronicle_core::event::{GlobalSequence, NewEvent};
//! use chronicle_core::event_store::{EventStore, EventStoreError};
//! use chronicle_core::stream::{StreamId, StreamType, Version};
//!
//! async fn example(store: &dyn EventStore) -> Result<(), EventStoreError> {
//!     let result = store
//!         .append(
//!             StreamId::new("ticket-42"),
//!             StreamType::new("ticket"),
//!             Version::INITIAL,
//!             vec![NewEvent::new("TicketReserved.v1", b"A1".to_vec())],
//!         )
//!         .await?;
//!
//!     let batch = store.read_all(GlobalSequence::ZERO, 100).await?;
//!     assert_eq!(batch.last().map(|e| e.global_sequence), Some(result.last_global_sequence));
//!     Ok(())
//! }
//! ```

use crate::BoxFuture;
use crate::event::{GlobalSequence, NewEvent, RecordedEvent};
use crate::stream::{StreamId, StreamType, Version};
use thiserror::Error;

/// Errors that can occur during event store operations.
#[derive(Error, Debug)]
pub enum EventStoreError {
    /// The append request was rejected before touching storage.
    ///
    /// Empty or oversized batches, empty identifiers, overlong event types and
    /// stream type mismatches all end up here.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Optimistic concurrency conflict: expected version doesn't match current version.
    ///
    /// Another writer appended to the stream since the caller last read it.
    /// Nothing was written.
    #[error("Concurrency conflict on stream {stream_id}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        /// The stream ID where the conflict occurred.
        stream_id: StreamId,
        /// The version we expected the stream to be at.
        expected: Version,
        /// The actual current version of the stream.
        actual: Version,
    },

    /// The backing store could not be reached or the transaction failed.
    ///
    /// Transient. An append that fails with this error committed nothing.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Stored data could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl EventStoreError {
    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_))
    }
}

/// Outcome of a successful append.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendResult {
    /// The stream that was appended to.
    pub stream_id: StreamId,
    /// The stream's version after the append (= sequence of the last event).
    pub version: Version,
    /// Global sequence assigned to the first appended event.
    pub first_global_sequence: GlobalSequence,
    /// Global sequence assigned to the last appended event.
    pub last_global_sequence: GlobalSequence,
}

/// Size limits enforced on every append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendLimits {
    /// Maximum number of events in one append.
    pub max_events_per_append: usize,
    /// Maximum payload size of a single event, in bytes.
    pub max_payload_bytes: usize,
    /// Maximum length of an event type, in bytes.
    pub max_event_type_bytes: usize,
}

impl AppendLimits {
    /// Default maximum number of events in one append.
    pub const DEFAULT_MAX_EVENTS: usize = 500;
    /// Default maximum payload size (1 MiB).
    pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;
    /// Maximum event type length, matching the storage column.
    pub const MAX_EVENT_TYPE_BYTES: usize = 255;

    /// Override the maximum number of events per append.
    #[must_use]
    pub const fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events_per_append = max_events;
        self
    }

    /// Override the maximum payload size.
    #[must_use]
    pub const fn with_max_payload_bytes(mut self, max_payload_bytes: usize) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }
}

impl Default for AppendLimits {
    fn default() -> Self {
        Self {
            max_events_per_append: Self::DEFAULT_MAX_EVENTS,
            max_payload_bytes: Self::DEFAULT_MAX_PAYLOAD_BYTES,
            max_event_type_bytes: Self::MAX_EVENT_TYPE_BYTES,
        }
    }
}

/// Validate an append request against `limits`.
///
/// Called by every store implementation before opening a transaction.
///
/// # Errors
///
/// Returns [`EventStoreError::Validation`] describing the first violation found.
pub fn validate_append(
    stream_id: &StreamId,
    stream_type: &StreamType,
    events: &[NewEvent],
    limits: &AppendLimits,
) -> Result<(), EventStoreError> {
    if stream_id.as_str().is_empty() {
        return Err(EventStoreError::Validation(
            "stream_id cannot be empty".to_string(),
        ));
    }
    if stream_type.as_str().is_empty() {
        return Err(EventStoreError::Validation(
            "stream_type cannot be empty".to_string(),
        ));
    }
    if events.is_empty() {
        return Err(EventStoreError::Validation(
            "append requires at least one event".to_string(),
        ));
    }
    if events.len() > limits.max_events_per_append {
        return Err(EventStoreError::Validation(format!(
            "append of {} events exceeds the limit of {}",
            events.len(),
            limits.max_events_per_append
        )));
    }

    for (index, event) in events.iter().enumerate() {
        if event.event_type.is_empty() {
            return Err(EventStoreError::Validation(format!(
                "event {index}: event_type cannot be empty"
            )));
        }
        if event.event_type.len() > limits.max_event_type_bytes {
            return Err(EventStoreError::Validation(format!(
                "event {index}: event_type exceeds {} bytes",
                limits.max_event_type_bytes
            )));
        }
        if event.payload.len() > limits.max_payload_bytes {
            return Err(EventStoreError::Validation(format!(
                "event {index}: payload of {} bytes exceeds the limit of {}",
                event.payload.len(),
                limits.max_payload_bytes
            )));
        }
    }

    Ok(())
}

/// Event store abstraction: an append-only, globally ordered log.
///
/// # Ordering
///
/// - Within a stream, `sequence` runs 1, 2, 3, ... with no gaps
/// - Across the store, `global_sequence` runs 1, 2, 3, ... with no gaps, in
///   commit order, regardless of how appends to different streams interleave
///
/// Readers never observe a gap: an event with global sequence `n` is only
/// visible once every event below `n` is visible.
///
/// # Dyn Compatibility
///
/// This trait uses explicit boxed futures instead of `async fn` so it can be
/// shared as `Arc<dyn EventStore>` by the coordinator and the web layer.
pub trait EventStore: Send + Sync {
    /// Append events to a stream with optimistic concurrency control.
    ///
    /// All events are appended or none are. The stream is created on the first
    /// append, which must use `Version::INITIAL`.
    ///
    /// # Errors
    ///
    /// - [`EventStoreError::Validation`]: rejected by [`validate_append`] or
    ///   stream type mismatch
    /// - [`EventStoreError::ConcurrencyConflict`]: `expected_version` differs
    ///   from the stream's current version
    /// - [`EventStoreError::StorageUnavailable`]: nothing was committed
    fn append(
        &self,
        stream_id: StreamId,
        stream_type: StreamType,
        expected_version: Version,
        events: Vec<NewEvent>,
    ) -> BoxFuture<'_, Result<AppendResult, EventStoreError>>;

    /// Read a stream's events with `sequence >= from_version`, in order.
    ///
    /// An unknown stream yields an empty vector.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` or `Serialization` on storage failures.
    fn read_stream(
        &self,
        stream_id: StreamId,
        from_version: Version,
    ) -> BoxFuture<'_, Result<Vec<RecordedEvent>, EventStoreError>>;

    /// Read at most `batch_size` events with `global_sequence > after`, in order.
    ///
    /// Pass the last global sequence seen to continue.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` or `Serialization` on storage failures.
    fn read_all(
        &self,
        after: GlobalSequence,
        batch_size: usize,
    ) -> BoxFuture<'_, Result<Vec<RecordedEvent>, EventStoreError>>;

    /// The highest assigned global sequence (`GlobalSequence::ZERO` when empty).
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` on storage failures.
    fn head(&self) -> BoxFuture<'_, Result<GlobalSequence, EventStoreError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn events(count: usize) -> Vec<NewEvent> {
        (0..count)
            .map(|i| NewEvent::new("TicketReserved.v1", vec![u8::try_from(i % 256).unwrap_or(0)]))
            .collect()
    }

    fn validate(events: &[NewEvent], limits: &AppendLimits) -> Result<(), EventStoreError> {
        validate_append(
            &StreamId::new("ticket-42"),
            &StreamType::new("ticket"),
            events,
            limits,
        )
    }

    #[test]
    fn accepts_a_well_formed_batch() {
        assert!(validate(&events(3), &AppendLimits::default()).is_ok());
    }

    #[test]
    fn rejects_empty_batch_and_identifiers() {
        assert!(matches!(
            validate(&[], &AppendLimits::default()),
            Err(EventStoreError::Validation(_))
        ));
        assert!(matches!(
            validate_append(
                &StreamId::new(""),
                &StreamType::new("ticket"),
                &events(1),
                &AppendLimits::default()
            ),
            Err(EventStoreError::Validation(_))
        ));
        assert!(matches!(
            validate_append(
                &StreamId::new("ticket-42"),
                &StreamType::new(""),
                &events(1),
                &AppendLimits::default()
            ),
            Err(EventStoreError::Validation(_))
        ));
    }

    #[test]
    fn rejects_oversized_batch() {
        let limits = AppendLimits::default().with_max_events(2);
        assert!(validate(&events(2), &limits).is_ok());
        assert!(matches!(
            validate(&events(3), &limits),
            Err(EventStoreError::Validation(_))
        ));
    }

    #[test]
    fn rejects_oversized_payload() {
        let limits = AppendLimits::default().with_max_payload_bytes(4);
        let big = vec![NewEvent::new("Blob.v1", vec![0; 5])];
        assert!(matches!(
            validate(&big, &limits),
            Err(EventStoreError::Validation(_))
        ));
    }

    #[test]
    fn rejects_bad_event_types() {
        let empty = vec![NewEvent::new("", vec![])];
        assert!(validate(&empty, &AppendLimits::default()).is_err());

        let long = vec![NewEvent::new("x".repeat(256), vec![])];
        assert!(validate(&long, &AppendLimits::default()).is_err());

        let exact = vec![NewEvent::new("x".repeat(255), vec![])];
        assert!(validate(&exact, &AppendLimits::default()).is_ok());
    }

    #[test]
    fn only_storage_errors_are_transient() {
        assert!(EventStoreError::StorageUnavailable("down".into()).is_transient());
        assert!(!EventStoreError::Validation("bad".into()).is_transient());
        assert!(
            !EventStoreError::ConcurrencyConflict {
                stream_id: StreamId::new("s"),
                expected: Version::new(0),
                actual: Version::new(1),
            }
            .is_transient()
        );
    }
}
