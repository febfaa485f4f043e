//! # Chronicle Core
//!
//! Core traits and types for the Chronicle event store and projection system.
//!
//! This crate defines the storage-agnostic contract shared by every other crate
//! in the workspace:
//!
//! - **Event Store**: append-only, globally ordered log grouped into streams
//! - **Stream Registry**: per-stream version tracking for optimistic concurrency
//! - **Projections**: read models rebuilt by replaying the log from a checkpoint
//! - **Leases**: single-active-consumer ownership of a projection
//! - **Failure Ledger**: durable record of events a projector could not apply
//!
//! Implementations live in `chronicle-postgres` (production), `chronicle-testing`
//! (in-memory) and `chronicle-projections` (coordination).
//!
//! ## Example
//!
//! ```ignore
//! use chronicle_core::event::NewEvent;
//! use chronicle_core::event_store::EventStore;
//! use chronicle_core::stream::{StreamId, StreamType, Version};
//!
//! let result = store
//!     .append(
//!         StreamId::new("ticket-42"),
//!         StreamType::new("ticket"),
//!         Version::INITIAL,
//!         vec![NewEvent::new("TicketReserved.v1", payload)],
//!     )
//!     .await?;
//! assert_eq!(result.version.value(), 1);
//! ```

#![forbid(unsafe_code)]

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod event;
pub mod event_store;
pub mod failure;
pub mod lease;
pub mod projection;
pub mod statistics;
pub mod stream;

/// Environment module - Dependency injection traits
///
/// External dependencies that make behaviour non-deterministic (currently only
/// time) are abstracted behind traits so tests can control them.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Lease expiry, failure timestamps and stall detection all read time
    /// through this trait.
    ///
    /// # Examples
    ///
    /// ```
    /// use chronicle_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

/// Boxed future returned by the dyn-compatible storage traits.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
