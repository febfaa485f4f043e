//! # Chronicle Testing
//!
//! Testing utilities for the Chronicle event store and projection system.
//!
//! This crate provides:
//! - In-memory implementations of every storage trait
//! - Deterministic clocks
//! - Scriptable projectors and a projection test harness
//! - Property-based testing strategies
//!
//! ## Example
//!
//! ```ignore
//! use chronicle_testing::{InMemoryEventStore, helpers::ticket_events};
//!
//! #[tokio::test]
//! async fn appends_in_order() {
//!     let store = InMemoryEventStore::new();
//!     let result = store
//!         .append(StreamId::new("ticket-42"), StreamType::new("ticket"), Version::INITIAL, ticket_events(3))
//!         .await
//!         .unwrap();
//!     assert_eq!(result.version, Version::new(3));
//! }
//! ```

use chronicle_core::environment::Clock;
use chrono::{DateTime, Utc};

mod event_store_mocks;
mod failure_mocks;
mod projection_mocks;
mod projectors;

pub use event_store_mocks::InMemoryEventStore;
pub use failure_mocks::InMemoryFailureLedger;
pub use projection_mocks::{
    InMemoryProjectionRegistry, InMemoryProjectionStore, ProjectionTestHarness,
};
pub use projectors::RecordingProjector;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, Mutex};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use chronicle_testing::mocks::FixedClock;
    /// use chronicle_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can hand one clone to a store
    /// and keep another to expire leases.
    ///
    /// ```
    /// use chronicle_testing::mocks::ManualClock;
    /// use chronicle_core::environment::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::default();
    /// let start = clock.now();
    /// clock.advance(Duration::from_secs(31));
    /// assert_eq!((clock.now() - start).num_seconds(), 31);
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    #[allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
    impl ManualClock {
        /// Create a manual clock starting at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move time forward.
        pub fn advance(&self, by: std::time::Duration) {
            let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
            let mut time = self.time.lock().unwrap();
            *time += by;
        }

        /// Jump to an absolute time.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap() = to;
        }
    }

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new(test_clock().now())
        }
    }

    #[allow(clippy::unwrap_used)]
    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

/// Builders for test data.
pub mod helpers {
    use chronicle_core::event::{EventId, EventMetadata, GlobalSequence, NewEvent, RecordedEvent};
    use chronicle_core::stream::{StreamId, StreamType, Version};
    use chrono::Utc;

    /// `count` ticket events, each carrying its index as an eight-byte payload.
    #[must_use]
    pub fn ticket_events(count: usize) -> Vec<NewEvent> {
        (0..count)
            .map(|i| {
                NewEvent::new(
                    "TicketReserved.v1",
                    i.to_be_bytes().to_vec(),
                )
            })
            .collect()
    }

    /// A recorded event at `global_sequence` in `stream_id`, for feeding
    /// projectors directly without a store.
    #[must_use]
    pub fn recorded_event(
        global_sequence: u64,
        stream_id: &str,
        sequence: u64,
        event_type: &str,
    ) -> RecordedEvent {
        let now = Utc::now();
        RecordedEvent {
            id: EventId::generate(),
            stream_id: StreamId::new(stream_id),
            stream_type: StreamType::new(stream_id.split('-').next().unwrap_or(stream_id)),
            sequence: Version::new(sequence),
            global_sequence: GlobalSequence::new(global_sequence),
            event_type: event_type.to_string(),
            payload: Vec::new(),
            metadata: EventMetadata::at(now),
            recorded_at: now,
        }
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use proptest::prelude::*;

    /// One append in a generated workload: which stream, and how many events.
    #[derive(Clone, Debug)]
    pub struct PlannedAppend {
        /// Index of the target stream (`"stream-{index}"`).
        pub stream: usize,
        /// Number of events in the append.
        pub events: usize,
    }

    /// Interleaved appends across up to `streams` streams.
    pub fn append_plan(
        streams: usize,
        max_appends: usize,
    ) -> impl Strategy<Value = Vec<PlannedAppend>> {
        prop::collection::vec(
            (0..streams.max(1), 1..=5_usize)
                .prop_map(|(stream, events)| PlannedAppend { stream, events }),
            1..=max_appends.max(1),
        )
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock, test_clock};
