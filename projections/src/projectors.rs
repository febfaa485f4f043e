//! Built-in read models.
//!
//! Both projectors keep their rows in a [`ProjectionStore`] under a key prefix
//! and remember the last global sequence folded into each row. An event at or
//! below that sequence was already applied and is skipped, which makes
//! redelivery after a crash harmless.

use chronicle_core::BoxFuture;
use chronicle_core::event::{GlobalSequence, RecordedEvent};
use chronicle_core::projection::{ProjectionError, ProjectionStore, Projector, Result};
use chronicle_core::stream::Version;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| ProjectionError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| ProjectionError::Serialization(e.to_string()))
}

/// Count of one event type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventTypeCount {
    /// Events of this type applied so far.
    pub count: u64,
    /// Last global sequence counted.
    pub last_global_sequence: GlobalSequence,
}

/// Counts events per event type.
#[derive(Clone, Debug)]
pub struct EventTypeCountsProjector<S> {
    store: S,
}

impl<S: ProjectionStore> EventTypeCountsProjector<S> {
    /// Projection name.
    pub const NAME: &'static str = "event_type_counts";
    const PREFIX: &'static str = "event_type_counts:";

    /// Create the projector over `store`.
    #[must_use]
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    fn key(event_type: &str) -> String {
        format!("{}{event_type}", Self::PREFIX)
    }

    /// Count for one event type.
    ///
    /// # Errors
    ///
    /// Returns storage or decoding errors.
    pub async fn count(&self, event_type: &str) -> Result<Option<EventTypeCount>> {
        self.store
            .get(&Self::key(event_type))
            .await?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Every event type with its count, ordered by event type.
    ///
    /// # Errors
    ///
    /// Returns storage or decoding errors.
    pub async fn counts(&self) -> Result<Vec<(String, EventTypeCount)>> {
        self.store
            .scan_prefix(Self::PREFIX)
            .await?
            .into_iter()
            .map(|(key, bytes)| {
                let event_type = key
                    .strip_prefix(Self::PREFIX)
                    .unwrap_or(&key)
                    .to_string();
                Ok((event_type, decode(&bytes)?))
            })
            .collect()
    }
}

impl<S: ProjectionStore> Projector for EventTypeCountsProjector<S> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn apply<'a>(&'a self, event: &'a RecordedEvent) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let key = Self::key(&event.event_type);
            let current = match self.store.get(&key).await? {
                Some(bytes) => decode::<EventTypeCount>(&bytes)?,
                None => EventTypeCount {
                    count: 0,
                    last_global_sequence: GlobalSequence::ZERO,
                },
            };
            if event.global_sequence <= current.last_global_sequence {
                return Ok(());
            }

            let next = EventTypeCount {
                count: current.count + 1,
                last_global_sequence: event.global_sequence,
            };
            self.store.save(&key, &encode(&next)?).await
        })
    }

    fn reset(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let removed = self.store.clear_prefix(Self::PREFIX).await?;
            tracing::debug!(projection = Self::NAME, removed, "Read model cleared");
            Ok(())
        })
    }
}

/// Latest activity of one stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamActivity {
    /// Version of the last event seen.
    pub last_version: Version,
    /// Type of the last event seen.
    pub last_event_type: String,
    /// Global position of the last event seen.
    pub last_global_sequence: GlobalSequence,
    /// Events seen on the stream.
    pub event_count: u64,
}

/// Tracks the latest event of every stream.
#[derive(Clone, Debug)]
pub struct StreamActivityProjector<S> {
    store: S,
}

impl<S: ProjectionStore> StreamActivityProjector<S> {
    /// Projection name.
    pub const NAME: &'static str = "stream_activity";
    const PREFIX: &'static str = "stream_activity:";

    /// Create the projector over `store`.
    #[must_use]
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    fn key(stream_id: &str) -> String {
        format!("{}{stream_id}", Self::PREFIX)
    }

    /// Activity of one stream.
    ///
    /// # Errors
    ///
    /// Returns storage or decoding errors.
    pub async fn activity(&self, stream_id: &str) -> Result<Option<StreamActivity>> {
        self.store
            .get(&Self::key(stream_id))
            .await?
            .map(|bytes| decode(&bytes))
            .transpose()
    }
}

impl<S: ProjectionStore> Projector for StreamActivityProjector<S> {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn apply<'a>(&'a self, event: &'a RecordedEvent) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let key = Self::key(event.stream_id.as_str());
            let previous = match self.store.get(&key).await? {
                Some(bytes) => Some(decode::<StreamActivity>(&bytes)?),
                None => None,
            };
            if previous
                .as_ref()
                .is_some_and(|p| event.global_sequence <= p.last_global_sequence)
            {
                return Ok(());
            }

            let next = StreamActivity {
                last_version: event.sequence,
                last_event_type: event.event_type.clone(),
                last_global_sequence: event.global_sequence,
                event_count: previous.map_or(0, |p| p.event_count) + 1,
            };
            self.store.save(&key, &encode(&next)?).await
        })
    }

    fn reset(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.store.clear_prefix(Self::PREFIX).await?;
            Ok(())
        })
    }
}
