//! Event types for the append-only log.
//!
//! Events represent facts about things that have happened in the past and are
//! immutable once appended. The store treats payloads as opaque bytes tagged
//! with an `event_type`; interpreting them is the job of each projector.
//!
//! # Design
//!
//! Producers hand the store [`NewEvent`]s. The store assigns identity and
//! ordering and hands back [`RecordedEvent`]s:
//!
//! - `sequence`: position within the stream (1, 2, 3, ...)
//! - `global_sequence`: position within the whole log, gapless across streams
//!
//! Typed domain events can implement [`Event`] to get `bincode` serialization,
//! which is compact and fast for all-Rust consumers.
//!
//! # Example
//!
//! ```
//! use chronicle_core::event::{Event, EventMetadata, NewEvent};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! enum TicketEvent {
//!     Reserved { seat: String },
//!     Released { seat: String },
//! }
//!
//! impl Event for TicketEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             TicketEvent::Reserved { .. } => "TicketReserved.v1",
//!             TicketEvent::Released { .. } => "TicketReleased.v1",
//!         }
//!     }
//! }
//!
//! let event = TicketEvent::Reserved { seat: "A1".to_string() };
//! let new_event = NewEvent::from_event(&event, EventMetadata::now()).unwrap();
//! assert_eq!(new_event.event_type, "TicketReserved.v1");
//! ```

use crate::stream::{StreamId, StreamType, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Error types for event operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),

    /// Failed to deserialize event from bytes.
    #[error("Failed to deserialize event: {0}")]
    DeserializationError(String),
}

/// A typed domain event that can be stored in the log.
///
/// The `event_type()` string should be stable and carry a version suffix
/// (`"TicketReserved.v1"`) so schemas can evolve.
pub trait Event: Send + Sync + 'static {
    /// Returns the event type identifier for this event.
    fn event_type(&self) -> &'static str;

    /// Serialize this event to bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    fn to_bytes(&self) -> Result<Vec<u8>, EventError>
    where
        Self: Serialize,
    {
        bincode::serialize(self).map_err(|e| EventError::SerializationError(e.to_string()))
    }

    /// Deserialize an event from bincode bytes.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the bytes are corrupted or
    /// were produced by a different event type or schema.
    fn from_bytes(bytes: &[u8]) -> Result<Self, EventError>
    where
        Self: DeserializeOwned + Sized,
    {
        bincode::deserialize(bytes).map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

/// Unique identifier of a recorded event.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(Uuid);

impl EventId {
    /// Generate a fresh random event id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of an event in the whole log.
///
/// Global sequences start at 1 and are gapless: the `n`-th event ever appended
/// has global sequence `n`. `GlobalSequence::ZERO` denotes "before the first
/// event" and is the checkpoint of a projection that has applied nothing.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GlobalSequence(u64);

impl GlobalSequence {
    /// Position before the first event.
    pub const ZERO: Self = Self(0);

    /// Create a global sequence from a raw value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// The raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The following position.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Number of events between `other` and `self` (0 if `other` is ahead).
    #[must_use]
    pub const fn distance_from(self, other: Self) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl fmt::Display for GlobalSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for GlobalSequence {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<GlobalSequence> for u64 {
    fn from(sequence: GlobalSequence) -> Self {
        sequence.0
    }
}

/// Metadata attached to every event.
///
/// Stored as JSON next to the opaque payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Id of the command or event that caused this event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,

    /// Id linking all events of one business transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// User or service that produced the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,

    /// When the producer says the fact occurred.
    pub occurred_at: DateTime<Utc>,
}

impl EventMetadata {
    /// Metadata with only a timestamp.
    #[must_use]
    pub const fn at(occurred_at: DateTime<Utc>) -> Self {
        Self {
            causation_id: None,
            correlation_id: None,
            actor: None,
            occurred_at,
        }
    }

    /// Metadata stamped with the current time.
    #[must_use]
    pub fn now() -> Self {
        Self::at(Utc::now())
    }

    /// Set the causation id.
    #[must_use]
    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the actor.
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Convert to a JSON value for storage.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!(self)
    }

    /// Parse metadata from a stored JSON value.
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the JSON doesn't match.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, EventError> {
        serde_json::from_value(value.clone())
            .map_err(|e| EventError::DeserializationError(e.to_string()))
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::now()
    }
}

/// An event proposed for append.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewEvent {
    /// The event type identifier (e.g., `"TicketReserved.v1"`).
    pub event_type: String,

    /// Opaque payload bytes.
    pub payload: Vec<u8>,

    /// Causation/correlation/actor metadata.
    pub metadata: EventMetadata,
}

impl NewEvent {
    /// Create a new event with metadata stamped now.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            metadata: EventMetadata::now(),
        }
    }

    /// Replace the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: EventMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Create a new event from a typed [`Event`].
    ///
    /// # Errors
    ///
    /// Returns `EventError::SerializationError` if the event cannot be serialized.
    pub fn from_event<E: Event + Serialize>(
        event: &E,
        metadata: EventMetadata,
    ) -> Result<Self, EventError> {
        Ok(Self {
            event_type: event.event_type().to_string(),
            payload: event.to_bytes()?,
            metadata,
        })
    }
}

/// An event as stored in the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Unique event id.
    pub id: EventId,
    /// Stream the event belongs to.
    pub stream_id: StreamId,
    /// Type of that stream.
    pub stream_type: StreamType,
    /// Position within the stream (starts at 1).
    pub sequence: Version,
    /// Position within the whole log (starts at 1, gapless).
    pub global_sequence: GlobalSequence,
    /// The event type identifier.
    pub event_type: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Producer-supplied metadata.
    pub metadata: EventMetadata,
    /// When the store committed the event.
    pub recorded_at: DateTime<Utc>,
}

impl RecordedEvent {
    /// Decode the payload as a typed [`Event`].
    ///
    /// # Errors
    ///
    /// Returns `EventError::DeserializationError` if the payload doesn't match `E`.
    pub fn decode<E: Event + DeserializeOwned>(&self) -> Result<E, EventError> {
        E::from_bytes(&self.payload)
    }
}

impl fmt::Display for RecordedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} #{} ({}@{}, {} bytes)",
            self.event_type,
            self.global_sequence,
            self.stream_id,
            self.sequence,
            self.payload.len()
        )
    }
}
