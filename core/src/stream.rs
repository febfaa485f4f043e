//! Event stream identification, versioning and the stream registry.
//!
//! This module defines strong types for event stream identification (`StreamId`,
//! `StreamType`), version control (`Version`), the per-stream metadata record
//! (`Stream`) and the `StreamRegistry` abstraction that tracks each stream's
//! current version for optimistic concurrency control.

use crate::BoxFuture;
use crate::event_store::EventStoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `StreamId` and `StreamType` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid stream identifier: {0}")]
pub struct ParseStreamIdError(String);

/// Unique identifier for an event stream (one entity's lifecycle).
///
/// For example:
/// - `"ticket-42"`
/// - `"purchase-abc-def"`
///
/// # Validation
///
/// - `FromStr::from_str()`: Validates input (rejects empty strings)
/// - `From::from()` and `new()`: No validation (for internal use with trusted input)
///
/// The event store re-validates on append, so an empty id constructed with
/// `new()` is rejected there with a validation error.
///
/// # Examples
///
/// ```
/// use chronicle_core::stream::StreamId;
///
/// let stream_id = StreamId::new("ticket-42");
/// assert_eq!(stream_id.as_str(), "ticket-42");
///
/// let parsed: StreamId = "purchase-7".parse().unwrap();
/// assert_eq!(parsed, StreamId::new("purchase-7"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    /// Create a new `StreamId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the stream ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the `StreamId` into its inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamId {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseStreamIdError("Stream ID cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Category of a stream (`"ticket"`, `"purchase"`, ...).
///
/// A stream's type is fixed when the stream is created by its first append.
/// Statistics are grouped by stream type.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamType(String);

impl StreamType {
    /// Create a new `StreamType` from a string.
    #[must_use]
    pub fn new(stream_type: impl Into<String>) -> Self {
        Self(stream_type.into())
    }

    /// Get the stream type as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StreamType {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseStreamIdError("Stream type cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for StreamType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for StreamType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Per-stream version number for optimistic concurrency control.
///
/// A new stream is at version 0. Each appended event increments the version by
/// exactly one, and the event's per-stream `sequence` equals the version the
/// stream reached when it was appended. Appending requires the caller to state
/// the version it expects the stream to be at:
///
/// - If the stream's current version doesn't match, the append fails
/// - This prevents lost updates in concurrent scenarios
///
/// # Examples
///
/// ```
/// use chronicle_core::stream::Version;
///
/// let v0 = Version::INITIAL;
/// let v1 = v0.next();
/// assert_eq!(v1, Version::new(1));
/// assert_eq!(Version::new(5).value(), 5);
/// ```
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Version(u64);

impl Version {
    /// The initial version (0) of a stream that has no events.
    pub const INITIAL: Self = Self(0);

    /// Create a new `Version` with the given value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the version number.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// Get the next version (current + 1).
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Check if this is the initial version (0).
    #[must_use]
    pub const fn is_initial(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Version> for u64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

impl std::ops::Add<u64> for Version {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

/// Stream metadata kept by the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stream {
    /// Stream identifier.
    pub stream_id: StreamId,
    /// Stream category, fixed at creation.
    pub stream_type: StreamType,
    /// Number of events appended so far.
    pub current_version: Version,
    /// When the stream received its first event.
    pub created_at: DateTime<Utc>,
    /// When the stream last received an event.
    pub updated_at: DateTime<Utc>,
}

/// Registry of stream metadata.
///
/// Streams are created implicitly by the first append. The registry's version
/// is updated in the same transaction as the appended events, so
/// `current_version` always equals the number of events stored for the stream.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so the registry can be shared as
/// `Arc<dyn StreamRegistry>`.
pub trait StreamRegistry: Send + Sync {
    /// Return the stream's metadata, creating it at version 0 if absent.
    ///
    /// # Errors
    ///
    /// - `Validation`: the stream exists with a different stream type, or an
    ///   identifier is empty
    /// - `StorageUnavailable`: the backing store could not be reached
    fn get_or_create(
        &self,
        stream_id: StreamId,
        stream_type: StreamType,
    ) -> BoxFuture<'_, Result<Stream, EventStoreError>>;

    /// Look up a stream without creating it.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the backing store could not be reached.
    fn get_stream(&self, stream_id: StreamId)
    -> BoxFuture<'_, Result<Option<Stream>, EventStoreError>>;

    /// Total number of streams that hold at least one event.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` if the backing store could not be reached.
    fn stream_count(&self) -> BoxFuture<'_, Result<u64, EventStoreError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    mod stream_id_tests {
        use super::*;

        #[test]
        fn new_creates_stream_id() {
            let id = StreamId::new("ticket-42");
            assert_eq!(id.as_str(), "ticket-42");
        }

        #[test]
        #[allow(clippy::expect_used)] // Panics: Test will fail if parse fails
        fn parse_from_str() {
            let id: StreamId = "ticket-42".parse().expect("parse should succeed");
            assert_eq!(id, StreamId::new("ticket-42"));
        }

        #[test]
        fn parse_empty_string_fails() {
            assert!("".parse::<StreamId>().is_err());
            assert!("".parse::<StreamType>().is_err());
        }

        #[test]
        fn display_and_into_inner() {
            let id = StreamId::new("ticket-42");
            assert_eq!(format!("{id}"), "ticket-42");
            assert_eq!(id.into_inner(), "ticket-42");
        }
    }

    mod version_tests {
        use super::*;

        #[test]
        fn initial_version() {
            assert_eq!(Version::INITIAL, Version::new(0));
            assert!(Version::INITIAL.is_initial());
            assert!(!Version::new(1).is_initial());
        }

        #[test]
        fn next_version() {
            let v1 = Version::INITIAL.next();
            assert_eq!(v1, Version::new(1));
            assert_eq!(v1.next(), Version::new(2));
            assert_eq!(Version::new(5) + 3, Version::new(8));
        }

        #[test]
        fn version_ordering() {
            assert!(Version::new(1) < Version::new(2));
            assert!(Version::new(3) > Version::new(1));
        }

        #[test]
        fn version_from_u64() {
            let version = Version::from(42_u64);
            assert_eq!(version.value(), 42);
            let num: u64 = version.into();
            assert_eq!(num, 42);
        }
    }
}
