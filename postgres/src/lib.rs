//! `PostgreSQL` storage for Chronicle.
//!
//! This crate provides the production implementations of the storage traits
//! from `chronicle-core`:
//!
//! - [`PostgresEventStore`]: append-only log with optimistic concurrency and a
//!   gapless global sequence, plus the stream registry and the monitoring
//!   queries (statistics and recent events)
//! - [`PostgresFailureLedger`]: durable record of projection failures
//!
//! Schema changes ship as sqlx migrations; call [`migrate`] once at startup.
//!
//! # Example
//!
//! ```ignore
//! use chronicle_postgres::{PostgresEventStore, PostgresFailureLedger};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = PostgresEventStore::new("postgres://localhost/chronicle").await?;
//!     chronicle_postgres::migrate(store.pool()).await?;
//!     let ledger = PostgresFailureLedger::new(store.pool().clone());
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chronicle_core::event_store::EventStoreError;
use sqlx::PgPool;

pub mod event_store;
pub mod failure_ledger;

pub use event_store::PostgresEventStore;
pub use failure_ledger::PostgresFailureLedger;

/// Apply the event store and failure ledger migrations.
///
/// Other crates keep their own migrations in the same database, so versions
/// this crate does not know about are ignored.
///
/// # Errors
///
/// Returns [`sqlx::migrate::MigrateError`] if a migration fails.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator.run(pool).await
}

pub(crate) fn storage_error(e: sqlx::Error) -> EventStoreError {
    match e {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            EventStoreError::Serialization(e.to_string())
        }
        other => EventStoreError::StorageUnavailable(other.to_string()),
    }
}

pub(crate) fn i64_to_u64(value: i64) -> Result<u64, EventStoreError> {
    u64::try_from(value)
        .map_err(|_| EventStoreError::Serialization(format!("negative value in storage: {value}")))
}

pub(crate) fn u64_to_i64(value: u64) -> Result<i64, EventStoreError> {
    i64::try_from(value)
        .map_err(|_| EventStoreError::Validation(format!("value out of range: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_reject_out_of_range_values() {
        assert_eq!(i64_to_u64(7).ok(), Some(7));
        assert!(matches!(i64_to_u64(-1), Err(EventStoreError::Serialization(_))));
        assert!(matches!(u64_to_i64(u64::MAX), Err(EventStoreError::Validation(_))));
    }

    #[test]
    fn decode_errors_are_serialization_errors() {
        let error = storage_error(sqlx::Error::Decode("bad bytes".into()));
        assert!(matches!(error, EventStoreError::Serialization(_)));

        let error = storage_error(sqlx::Error::PoolTimedOut);
        assert!(matches!(error, EventStoreError::StorageUnavailable(_)));
    }
}
