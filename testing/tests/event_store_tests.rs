//! Ordering and concurrency tests for the in-memory event store

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect
#![allow(clippy::panic)] // Tests can panic

use chronicle_core::event::{GlobalSequence, NewEvent};
use chronicle_core::event_store::{AppendLimits, EventStore, EventStoreError};
use chronicle_core::statistics::{EventLogQueries, RecentEventsQuery, StatisticsQuery};
use chronicle_core::stream::{StreamId, StreamRegistry, StreamType, Version};
use chronicle_testing::helpers::ticket_events;
use chronicle_testing::properties::append_plan;
use chronicle_testing::InMemoryEventStore;
use proptest::prelude::*;
use std::collections::HashMap;

fn ticket() -> StreamType {
    StreamType::new("ticket")
}

#[tokio::test]
async fn test_stale_writer_gets_conflict_and_nothing_changes() {
    let store = InMemoryEventStore::new();
    let stream = StreamId::new("ticket-42");

    let result = store
        .append(stream.clone(), ticket(), Version::INITIAL, ticket_events(3))
        .await
        .unwrap();
    assert_eq!(result.version, Version::new(3));
    assert_eq!(result.first_global_sequence, GlobalSequence::new(1));
    assert_eq!(result.last_global_sequence, GlobalSequence::new(3));

    let versions: Vec<_> = store
        .read_stream(stream.clone(), Version::INITIAL)
        .await
        .unwrap()
        .iter()
        .map(|e| e.sequence.value())
        .collect();
    assert_eq!(versions, vec![1, 2, 3]);

    let err = store
        .append(stream.clone(), ticket(), Version::INITIAL, ticket_events(1))
        .await
        .unwrap_err();
    match err {
        EventStoreError::ConcurrencyConflict {
            stream_id,
            expected,
            actual,
        } => {
            assert_eq!(stream_id, stream);
            assert_eq!(expected, Version::INITIAL);
            assert_eq!(actual, Version::new(3));
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    let meta = store.get_stream(stream).await.unwrap().expect("stream exists");
    assert_eq!(meta.current_version, Version::new(3));
    assert_eq!(store.head().await.unwrap(), GlobalSequence::new(3));
}

#[tokio::test]
async fn test_stream_type_is_fixed_at_creation() {
    let store = InMemoryEventStore::new();
    let stream = StreamId::new("ticket-1");
    store
        .append(stream.clone(), ticket(), Version::INITIAL, ticket_events(1))
        .await
        .unwrap();

    let err = store
        .append(stream, StreamType::new("purchase"), Version::new(1), ticket_events(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EventStoreError::Validation(_)));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_invalid_batches_are_rejected_atomically() {
    let store = InMemoryEventStore::new().with_limits(AppendLimits::default().with_max_events(2));
    let stream = StreamId::new("ticket-1");

    let err = store
        .append(stream.clone(), ticket(), Version::INITIAL, ticket_events(3))
        .await
        .unwrap_err();
    assert!(matches!(err, EventStoreError::Validation(_)));

    let mut batch = ticket_events(1);
    batch.push(NewEvent::new("", vec![]));
    assert!(
        store
            .append(stream, ticket(), Version::INITIAL, batch)
            .await
            .is_err()
    );
    assert!(store.is_empty());
    assert_eq!(store.stream_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_read_all_is_exclusive_and_bounded() {
    let store = InMemoryEventStore::new();
    for i in 0..4 {
        store
            .append(
                StreamId::new(format!("ticket-{i}")),
                ticket(),
                Version::INITIAL,
                ticket_events(2),
            )
            .await
            .unwrap();
    }

    let batch = store.read_all(GlobalSequence::new(3), 3).await.unwrap();
    let seqs: Vec<_> = batch.iter().map(|e| e.global_sequence.value()).collect();
    assert_eq!(seqs, vec![4, 5, 6]);

    let tail = store.read_all(GlobalSequence::new(8), 10).await.unwrap();
    assert!(tail.is_empty());
    assert!(
        store
            .read_stream(StreamId::new("unknown"), Version::INITIAL)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_unavailable_store_commits_nothing() {
    let store = InMemoryEventStore::new();
    store.set_unavailable(true);
    let err = store
        .append(StreamId::new("ticket-1"), ticket(), Version::INITIAL, ticket_events(1))
        .await
        .unwrap_err();
    assert!(err.is_transient());

    store.set_unavailable(false);
    assert_eq!(store.head().await.unwrap(), GlobalSequence::ZERO);
}

#[tokio::test]
async fn test_get_or_create_registers_empty_stream() {
    let store = InMemoryEventStore::new();
    let stream = store
        .get_or_create(StreamId::new("ticket-9"), ticket())
        .await
        .unwrap();
    assert_eq!(stream.current_version, Version::INITIAL);
    assert_eq!(store.stream_count().await.unwrap(), 0);

    assert!(
        store
            .get_or_create(StreamId::new("ticket-9"), StreamType::new("purchase"))
            .await
            .is_err()
    );
}

#[tokio::test]
async fn test_recent_events_pages_backwards() {
    let store = InMemoryEventStore::new();
    store
        .append(StreamId::new("ticket-1"), ticket(), Version::INITIAL, ticket_events(5))
        .await
        .unwrap();

    let first = store
        .recent_events(RecentEventsQuery {
            limit: 2,
            ..RecentEventsQuery::default()
        })
        .await
        .unwrap();
    let seqs: Vec<_> = first.events.iter().map(|e| e.global_sequence.value()).collect();
    assert_eq!(seqs, vec![5, 4]);
    assert_eq!(first.next_before, Some(GlobalSequence::new(4)));

    let last = store
        .recent_events(RecentEventsQuery {
            limit: 10,
            before: first.next_before,
            ..RecentEventsQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(last.events.len(), 3);
    assert_eq!(last.next_before, None);

    let stats = store.statistics(StatisticsQuery::default()).await.unwrap();
    assert_eq!(stats.total, 5);
    assert_eq!(stats.totals_by_stream_type["ticket"], 5);
}

#[tokio::test]
async fn test_concurrent_appends_stay_gapless() {
    let store = InMemoryEventStore::new();
    let mut handles = Vec::new();
    for i in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let stream = StreamId::new(format!("ticket-{i}"));
            let mut version = Version::INITIAL;
            for _ in 0..10 {
                version = store
                    .append(stream.clone(), StreamType::new("ticket"), version, ticket_events(2))
                    .await
                    .unwrap()
                    .version;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let events = store.read_all(GlobalSequence::ZERO, 1_000).await.unwrap();
    assert_eq!(events.len(), 160);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.global_sequence.value(), i as u64 + 1);
    }
}

proptest! {
    #[test]
    fn prop_sequences_are_gapless(plan in append_plan(4, 30)) {
        let store = InMemoryEventStore::new();
        let mut versions: HashMap<usize, Version> = HashMap::new();

        tokio_test::block_on(async {
            for step in &plan {
                let expected = versions.get(&step.stream).copied().unwrap_or_default();
                let result = store
                    .append(
                        StreamId::new(format!("stream-{}", step.stream)),
                        StreamType::new("test"),
                        expected,
                        ticket_events(step.events),
                    )
                    .await
                    .unwrap();
                versions.insert(step.stream, result.version);
            }
        });

        let events = tokio_test::block_on(store.read_all(GlobalSequence::ZERO, 10_000)).unwrap();
        let total: usize = plan.iter().map(|s| s.events).sum();
        prop_assert_eq!(events.len(), total);
        for (i, event) in events.iter().enumerate() {
            prop_assert_eq!(event.global_sequence.value(), i as u64 + 1);
        }

        for (stream, version) in &versions {
            let stream_events = tokio_test::block_on(
                store.read_stream(StreamId::new(format!("stream-{stream}")), Version::INITIAL),
            )
            .unwrap();
            prop_assert_eq!(stream_events.len() as u64, version.value());
            for (i, event) in stream_events.iter().enumerate() {
                prop_assert_eq!(event.sequence.value(), i as u64 + 1);
            }
        }
    }

    #[test]
    fn prop_stale_expected_version_always_conflicts(first in 1..5_usize, stale in 0..5_u64) {
        let store = InMemoryEventStore::new();
        let stream = StreamId::new("ticket-1");
        tokio_test::block_on(store.append(stream.clone(), StreamType::new("ticket"), Version::INITIAL, ticket_events(first))).unwrap();

        let current = first as u64;
        prop_assume!(stale != current);
        let result = tokio_test::block_on(store.append(stream.clone(), StreamType::new("ticket"), Version::new(stale), ticket_events(1)));
        let is_conflict = matches!(result, Err(EventStoreError::ConcurrencyConflict { .. }));
        prop_assert!(is_conflict);
        prop_assert_eq!(store.len(), first);
    }
}
