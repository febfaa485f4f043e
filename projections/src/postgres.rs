//! `PostgreSQL` implementations for projections.
//!
//! # Overview
//!
//! - [`PostgresProjectionStore`]: key/value read-model storage (`projection_data` table)
//! - [`PostgresProjectionRegistry`]: projection state and leases (`projections` table)
//!
//! The read side may live in a separate database from the event store; see
//! [`PostgresProjectionStore::new_with_separate_db`].
//!
//! ```text
//! Write Side (Event Store)          Read Side (Projections)
//! ┌─────────────────────┐          ┌─────────────────────┐
//! │  events             │          │  projections        │
//! │  streams            │   →→→    │  projection_data    │
//! │  processing_failures│  Events  │                     │
//! └─────────────────────┘          └─────────────────────┘
//! ```
//!
//! # Leases
//!
//! Lease acquisition and every commit are single conditional `UPDATE`s
//! evaluated against the database clock:
//!
//! ```sql
//! UPDATE projections
//!    SET lease_owner = $2, lease_token = lease_token + 1, lease_expires_at = now() + ttl
//!  WHERE name = $1 AND (lease_owner IS NULL OR lease_expires_at <= now())
//! ```
//!
//! A commit only matches while `(lease_owner, lease_token)` are unchanged and
//! the lease has not expired, so a worker that lost its lease cannot move the
//! checkpoint.

use chronicle_core::BoxFuture;
use chronicle_core::event::GlobalSequence;
use chronicle_core::lease::{Lease, LeaseOwner};
use chronicle_core::projection::{
    ProjectionError, ProjectionRegistry, ProjectionState, ProjectionStatus, ProjectionStore,
    ProjectionUpdate, Result,
};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use std::time::Duration;

/// Run the projection migrations (`projections`, `projection_data`).
///
/// Shares the database with other migrators: versions it does not know are
/// ignored.
///
/// # Errors
///
/// Returns [`ProjectionError::Storage`] if migration fails.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
        .run(pool)
        .await
        .map_err(|e| ProjectionError::Storage(format!("Migration failed: {e}")))
}

/// PostgreSQL-backed projection store.
///
/// ```sql
/// CREATE TABLE projection_data (
///     key TEXT PRIMARY KEY,
///     data BYTEA NOT NULL,
///     updated_at TIMESTAMPTZ NOT NULL
/// );
/// ```
///
/// # Example
///
/// ```ignore
/// let store = PostgresProjectionStore::new(pool, "projection_data".to_string());
/// store.save("event_type_counts:TicketReserved.v1", &data).await?;
/// let removed = store.clear_prefix("event_type_counts:").await?;
/// ```
#[derive(Clone, Debug)]
pub struct PostgresProjectionStore {
    pool: PgPool,
    table_name: String,
}

impl PostgresProjectionStore {
    /// Default table name.
    pub const DEFAULT_TABLE: &'static str = "projection_data";

    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool, table_name: String) -> Self {
        Self { pool, table_name }
    }

    /// Create a store with its own connection to a read-side database.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Storage`] if connection fails.
    pub async fn new_with_separate_db(database_url: &str, table_name: String) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to connect: {e}")))?;

        Ok(Self::new(pool, table_name))
    }

    /// Underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Table holding the data.
    #[must_use]
    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

/// `LIKE` pattern matching keys that start with `prefix` literally.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for c in prefix.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

impl ProjectionStore for PostgresProjectionStore {
    async fn save(&self, key: &str, data: &[u8]) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (key, data, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (key) DO UPDATE
             SET data = EXCLUDED.data, updated_at = now()",
            self.table_name
        );

        sqlx::query(&query)
            .bind(key)
            .bind(data)
            .execute(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to save: {e}")))?;

        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let query = format!("SELECT data FROM {} WHERE key = $1", self.table_name);

        let result: Option<(Vec<u8>,)> = sqlx::query_as(&query)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to get: {e}")))?;

        Ok(result.map(|(data,)| data))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let query = format!("DELETE FROM {} WHERE key = $1", self.table_name);

        sqlx::query(&query)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to delete: {e}")))?;

        Ok(())
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<u64> {
        let query = format!(
            "DELETE FROM {} WHERE key LIKE $1 ESCAPE '\\'",
            self.table_name
        );

        let result = sqlx::query(&query)
            .bind(like_prefix(prefix))
            .execute(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to clear prefix: {e}")))?;

        Ok(result.rows_affected())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let query = format!(
            "SELECT key, data FROM {} WHERE key LIKE $1 ESCAPE '\\' ORDER BY key",
            self.table_name
        );

        sqlx::query_as(&query)
            .bind(like_prefix(prefix))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to scan prefix: {e}")))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let query = format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE key = $1)",
            self.table_name
        );

        let (exists,): (bool,) = sqlx::query_as(&query)
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ProjectionError::Storage(format!("Failed to check exists: {e}")))?;

        Ok(exists)
    }
}

/// PostgreSQL-backed projection registry.
///
/// # Schema
///
/// ```sql
/// CREATE TABLE projections (
///     name TEXT PRIMARY KEY,
///     checkpoint BIGINT NOT NULL DEFAULT 0,
///     status TEXT NOT NULL DEFAULT 'running',
///     last_error TEXT,
///     rebuild_target BIGINT,
///     lease_owner TEXT,
///     lease_token BIGINT NOT NULL DEFAULT 0,
///     lease_expires_at TIMESTAMPTZ,
///     updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
/// );
/// ```
#[derive(Clone, Debug)]
pub struct PostgresProjectionRegistry {
    pool: PgPool,
}

const STATE_COLUMNS: &str = "name, checkpoint, status, last_error, rebuild_target, updated_at";

fn checkpoint_error(context: &str, e: &sqlx::Error) -> ProjectionError {
    ProjectionError::Checkpoint(format!("{context}: {e}"))
}

fn to_db(sequence: GlobalSequence) -> Result<i64> {
    i64::try_from(sequence.value())
        .map_err(|_| ProjectionError::Checkpoint(format!("sequence {sequence} out of range")))
}

fn from_db(value: i64) -> Result<GlobalSequence> {
    u64::try_from(value)
        .map(GlobalSequence::new)
        .map_err(|_| ProjectionError::Checkpoint(format!("negative sequence {value}")))
}

fn ttl_seconds(ttl: Duration) -> f64 {
    ttl.as_secs_f64()
}

fn state_from_row(row: &PgRow) -> Result<ProjectionState> {
    let read = |e: sqlx::Error| checkpoint_error("Failed to decode projection", &e);
    let status: String = row.try_get("status").map_err(read)?;
    let rebuild_target: Option<i64> = row.try_get("rebuild_target").map_err(read)?;

    Ok(ProjectionState {
        name: row.try_get("name").map_err(read)?,
        checkpoint: from_db(row.try_get("checkpoint").map_err(read)?)?,
        status: status.parse::<ProjectionStatus>()?,
        last_error: row.try_get("last_error").map_err(read)?,
        rebuild_target: rebuild_target.map(from_db).transpose()?,
        updated_at: row.try_get("updated_at").map_err(read)?,
    })
}

fn lease_from_row(row: &PgRow) -> Result<Lease> {
    let read = |e: sqlx::Error| checkpoint_error("Failed to decode lease", &e);
    let owner: String = row.try_get("lease_owner").map_err(read)?;
    let token: i64 = row.try_get("lease_token").map_err(read)?;

    Ok(Lease {
        projection: row.try_get("name").map_err(read)?,
        owner: LeaseOwner::new(owner),
        token: u64::try_from(token)
            .map_err(|_| ProjectionError::Checkpoint(format!("negative lease token {token}")))?,
        expires_at: row.try_get("lease_expires_at").map_err(read)?,
    })
}

fn lease_token(lease: &Lease) -> Result<i64> {
    i64::try_from(lease.token).map_err(|_| {
        ProjectionError::Checkpoint(format!("lease token {} out of range", lease.token))
    })
}

impl PostgresProjectionRegistry {
    /// Create a registry over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM projections WHERE name = $1)")
                .bind(name)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| checkpoint_error("Failed to look up projection", &e))?;
        Ok(exists)
    }
}

impl ProjectionRegistry for PostgresProjectionRegistry {
    fn register(&self, name: &str) -> BoxFuture<'_, Result<ProjectionState>> {
        let name = name.to_string();
        Box::pin(async move {
            sqlx::query("INSERT INTO projections (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
                .bind(&name)
                .execute(&self.pool)
                .await
                .map_err(|e| checkpoint_error("Failed to register projection", &e))?;

            self.load(&name)
                .await?
                .ok_or(ProjectionError::NotFound(name))
        })
    }

    fn load(&self, name: &str) -> BoxFuture<'_, Result<Option<ProjectionState>>> {
        let name = name.to_string();
        Box::pin(async move {
            let query = format!("SELECT {STATE_COLUMNS} FROM projections WHERE name = $1");
            let row = sqlx::query(&query)
                .bind(name)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| checkpoint_error("Failed to load projection", &e))?;

            row.as_ref().map(state_from_row).transpose()
        })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<ProjectionState>>> {
        Box::pin(async move {
            let query = format!("SELECT {STATE_COLUMNS} FROM projections ORDER BY name");
            let rows = sqlx::query(&query)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| checkpoint_error("Failed to list projections", &e))?;

            rows.iter().map(state_from_row).collect()
        })
    }

    fn commit<'a>(
        &'a self,
        lease: &'a Lease,
        update: ProjectionUpdate,
    ) -> BoxFuture<'a, Result<ProjectionState>> {
        Box::pin(async move {
            let checkpoint = update.checkpoint.map(to_db).transpose()?;
            let rebuild_target = match update.rebuild_target {
                Some(target) => Some(target.map(to_db).transpose()?),
                None => None,
            };

            let query = format!(
                "UPDATE projections
                    SET checkpoint = COALESCE($3, checkpoint),
                        status = COALESCE($4, status),
                        last_error = CASE WHEN $5 THEN $6 ELSE last_error END,
                        rebuild_target = CASE WHEN $7 THEN $8 ELSE rebuild_target END,
                        updated_at = now()
                  WHERE name = $1
                    AND lease_owner = $2
                    AND lease_token = $9
                    AND lease_expires_at > now()
                  RETURNING {STATE_COLUMNS}"
            );
            let row = sqlx::query(&query)
                .bind(&lease.projection)
                .bind(lease.owner.as_str())
                .bind(checkpoint)
                .bind(update.status.map(ProjectionStatus::as_str))
                .bind(update.last_error.is_some())
                .bind(update.last_error.clone().flatten())
                .bind(rebuild_target.is_some())
                .bind(rebuild_target.flatten())
                .bind(lease_token(lease)?)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| checkpoint_error("Failed to commit projection state", &e))?;

            match row {
                Some(row) => state_from_row(&row),
                None => {
                    tracing::warn!(
                        projection = %lease.projection,
                        owner = %lease.owner,
                        token = lease.token,
                        "Commit rejected: lease no longer held"
                    );
                    Err(ProjectionError::LeaseLost {
                        projection: lease.projection.clone(),
                    })
                }
            }
        })
    }

    fn try_acquire_lease<'a>(
        &'a self,
        name: &'a str,
        owner: &'a LeaseOwner,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<Option<Lease>>> {
        Box::pin(async move {
            let row = sqlx::query(
                "UPDATE projections
                    SET lease_owner = $2,
                        lease_token = lease_token + 1,
                        lease_expires_at = now() + make_interval(secs => $3)
                  WHERE name = $1
                    AND (lease_owner IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= now())
                  RETURNING name, lease_owner, lease_token, lease_expires_at",
            )
            .bind(name)
            .bind(owner.as_str())
            .bind(ttl_seconds(ttl))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| checkpoint_error("Failed to acquire lease", &e))?;

            match row {
                Some(row) => {
                    let lease = lease_from_row(&row)?;
                    tracing::debug!(
                        projection = name,
                        owner = %owner,
                        token = lease.token,
                        "Lease acquired"
                    );
                    Ok(Some(lease))
                }
                None if self.exists(name).await? => Ok(None),
                None => Err(ProjectionError::NotFound(name.to_string())),
            }
        })
    }

    fn renew_lease<'a>(&'a self, lease: &'a Lease, ttl: Duration) -> BoxFuture<'a, Result<Lease>> {
        Box::pin(async move {
            let row = sqlx::query(
                "UPDATE projections
                    SET lease_expires_at = now() + make_interval(secs => $4)
                  WHERE name = $1
                    AND lease_owner = $2
                    AND lease_token = $3
                    AND lease_expires_at > now()
                  RETURNING name, lease_owner, lease_token, lease_expires_at",
            )
            .bind(&lease.projection)
            .bind(lease.owner.as_str())
            .bind(lease_token(lease)?)
            .bind(ttl_seconds(ttl))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| checkpoint_error("Failed to renew lease", &e))?;

            row.as_ref()
                .map(lease_from_row)
                .transpose()?
                .ok_or_else(|| ProjectionError::LeaseLost {
                    projection: lease.projection.clone(),
                })
        })
    }

    fn release_lease<'a>(&'a self, lease: &'a Lease) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            sqlx::query(
                "UPDATE projections
                    SET lease_owner = NULL, lease_expires_at = NULL
                  WHERE name = $1 AND lease_owner = $2 AND lease_token = $3",
            )
            .bind(&lease.projection)
            .bind(lease.owner.as_str())
            .bind(lease_token(lease)?)
            .execute(&self.pool)
            .await
            .map_err(|e| checkpoint_error("Failed to release lease", &e))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_prefix_escapes_wildcards() {
        assert_eq!(like_prefix("event_type_counts:"), "event\\_type\\_counts:%");
        assert_eq!(like_prefix("100%"), "100\\%%");
        assert_eq!(like_prefix(""), "%");
    }

    #[test]
    fn sequences_outside_bigint_are_rejected() {
        assert!(to_db(GlobalSequence::new(u64::MAX)).is_err());
        assert_eq!(to_db(GlobalSequence::new(7)).ok(), Some(7));
        assert!(from_db(-1).is_err());
    }
}
