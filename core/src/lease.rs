//! Fenced, expiring ownership of a projection.
//!
//! At most one consumer processes a projection at a time. Ownership is a
//! [`Lease`] acquired through the projection registry: it expires unless
//! renewed, and each acquisition bumps a fencing `token`. Writes carry the
//! token, so a consumer whose lease has expired and been taken over can no
//! longer commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of a lease holder (one per coordinator process).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseOwner(String);

impl LeaseOwner {
    /// Create an owner from an explicit name.
    #[must_use]
    pub fn new(owner: impl Into<String>) -> Self {
        Self(owner.into())
    }

    /// Generate a unique owner id.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("coordinator-{}", Uuid::new_v4()))
    }

    /// The owner id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LeaseOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A held lease on one projection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Projection the lease covers.
    pub projection: String,
    /// Holder.
    pub owner: LeaseOwner,
    /// Fencing token. Strictly increasing per projection across acquisitions.
    pub token: u64,
    /// Instant after which another owner may take the lease.
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Whether the lease has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn generated_owners_are_unique() {
        assert_ne!(LeaseOwner::generate(), LeaseOwner::generate());
        assert_eq!(LeaseOwner::new("w1").as_str(), "w1");
    }

    #[test]
    fn lease_expiry_is_inclusive() {
        let now = Utc::now();
        let lease = Lease {
            projection: "ticket_stats".into(),
            owner: LeaseOwner::new("w1"),
            token: 1,
            expires_at: now + Duration::seconds(30),
        };
        assert!(!lease.is_expired(now));
        assert!(lease.is_expired(now + Duration::seconds(30)));
    }
}
