//! In-memory projection testing utilities
//!
//! Provides fast, deterministic testing infrastructure for projections:
//! - [`InMemoryProjectionStore`]: `BTreeMap`-based read-model storage
//! - [`InMemoryProjectionRegistry`]: projection state and fenced leases
//! - [`ProjectionTestHarness`]: Fluent API for projector tests

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Test utilities document panics where critical

use chronicle_core::BoxFuture;
use chronicle_core::environment::{Clock, SystemClock};
use chronicle_core::event::RecordedEvent;
use chronicle_core::lease::{Lease, LeaseOwner};
use chronicle_core::projection::{
    ProjectionError, ProjectionRegistry, ProjectionState, ProjectionStore, ProjectionUpdate,
    Projector, Result,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// In-memory projection store for fast, deterministic testing.
///
/// Complements [`crate::InMemoryEventStore`] to provide a complete in-memory
/// testing infrastructure. Clones share the same data.
///
/// # Example
///
/// ```
/// use chronicle_testing::InMemoryProjectionStore;
/// use chronicle_core::projection::ProjectionStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryProjectionStore::new();
///
/// // Save projection data
/// store.save("event_type:TicketReserved.v1", b"3").await?;
///
/// // Retrieve projection data
/// let data = store.get("event_type:TicketReserved.v1").await?;
/// assert!(data.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryProjectionStore {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryProjectionStore {
    /// Create a new empty in-memory projection store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all projection data (for test isolation)
    pub fn clear(&self) {
        self.data.write().unwrap().clear();
    }

    /// Get the number of stored entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    /// Check if the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().unwrap().is_empty()
    }

    /// Check if a key exists in the store
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.read().unwrap().contains_key(key)
    }

    /// Get all keys in the store, sorted
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.data.read().unwrap().keys().cloned().collect()
    }

    /// Copy of the whole store, for comparing read models.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.data.read().unwrap().clone()
    }
}

impl ProjectionStore for InMemoryProjectionStore {
    async fn save(&self, key: &str, data: &[u8]) -> Result<()> {
        self.data
            .write()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.read().unwrap().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.write().unwrap().remove(key);
        Ok(())
    }

    async fn clear_prefix(&self, prefix: &str) -> Result<u64> {
        let mut data = self.data.write().unwrap();
        let before = data.len();
        data.retain(|key, _| !key.starts_with(prefix));
        Ok((before - data.len()) as u64)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .data
            .read()
            .unwrap()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.data.read().unwrap().contains_key(key))
    }
}

#[derive(Debug, Clone)]
struct Entry {
    state: ProjectionState,
    lease_owner: Option<LeaseOwner>,
    lease_token: u64,
    lease_expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn holds(&self, lease: &Lease, now: DateTime<Utc>) -> bool {
        self.lease_owner.as_ref() == Some(&lease.owner)
            && self.lease_token == lease.token
            && self.lease_expires_at.is_some_and(|at| now < at)
    }
}

/// In-memory projection registry with fenced leases.
///
/// Lease expiry is judged with the injected [`Clock`], so tests can expire a
/// lease by advancing a [`crate::ManualClock`].
#[derive(Clone)]
pub struct InMemoryProjectionRegistry {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryProjectionRegistry {
    /// Create an empty registry using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty registry judging lease expiry with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            clock,
        }
    }

    /// Current state of a projection, bypassing the async API.
    #[must_use]
    pub fn state(&self, name: &str) -> Option<ProjectionState> {
        self.entries
            .read()
            .unwrap()
            .get(name)
            .map(|e| e.state.clone())
    }

    /// Current lease holder of a projection, if the lease is unexpired.
    #[must_use]
    pub fn lease_holder(&self, name: &str) -> Option<LeaseOwner> {
        let now = self.clock.now();
        self.entries.read().unwrap().get(name).and_then(|e| {
            e.lease_owner
                .clone()
                .filter(|_| e.lease_expires_at.is_some_and(|at| now < at))
        })
    }

    /// Overwrite a projection's state, ignoring leases. Test setup only.
    pub fn force_state(&self, state: ProjectionState) {
        let mut entries = self.entries.write().unwrap();
        let entry = entries.entry(state.name.clone()).or_insert_with(|| Entry {
            state: state.clone(),
            lease_owner: None,
            lease_token: 0,
            lease_expires_at: None,
        });
        entry.state = state;
    }

    fn expiry(&self, ttl: Duration) -> DateTime<Utc> {
        self.clock.now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX)
    }
}

impl Default for InMemoryProjectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryProjectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryProjectionRegistry")
            .field("projections", &self.entries.read().unwrap().len())
            .finish_non_exhaustive()
    }
}

impl ProjectionRegistry for InMemoryProjectionRegistry {
    fn register(&self, name: &str) -> BoxFuture<'_, Result<ProjectionState>> {
        let name = name.to_string();
        Box::pin(async move {
            let now = self.clock.now();
            let mut entries = self.entries.write().unwrap();
            let entry = entries.entry(name.clone()).or_insert_with(|| Entry {
                state: ProjectionState::new(name, now),
                lease_owner: None,
                lease_token: 0,
                lease_expires_at: None,
            });
            Ok(entry.state.clone())
        })
    }

    fn load(&self, name: &str) -> BoxFuture<'_, Result<Option<ProjectionState>>> {
        let name = name.to_string();
        Box::pin(async move { Ok(self.state(&name)) })
    }

    fn list(&self) -> BoxFuture<'_, Result<Vec<ProjectionState>>> {
        Box::pin(async move {
            let mut states: Vec<_> = self
                .entries
                .read()
                .unwrap()
                .values()
                .map(|e| e.state.clone())
                .collect();
            states.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(states)
        })
    }

    fn commit<'a>(
        &'a self,
        lease: &'a Lease,
        update: ProjectionUpdate,
    ) -> BoxFuture<'a, Result<ProjectionState>> {
        Box::pin(async move {
            let now = self.clock.now();
            let mut entries = self.entries.write().unwrap();
            let entry = entries
                .get_mut(&lease.projection)
                .ok_or_else(|| ProjectionError::NotFound(lease.projection.clone()))?;
            if !entry.holds(lease, now) {
                return Err(ProjectionError::LeaseLost {
                    projection: lease.projection.clone(),
                });
            }
            entry.state.apply_update(&update, now);
            Ok(entry.state.clone())
        })
    }

    fn try_acquire_lease<'a>(
        &'a self,
        name: &'a str,
        owner: &'a LeaseOwner,
        ttl: Duration,
    ) -> BoxFuture<'a, Result<Option<Lease>>> {
        Box::pin(async move {
            let now = self.clock.now();
            let expires_at = self.expiry(ttl);
            let mut entries = self.entries.write().unwrap();
            let entry = entries
                .get_mut(name)
                .ok_or_else(|| ProjectionError::NotFound(name.to_string()))?;

            let held = entry.lease_owner.is_some()
                && entry.lease_expires_at.is_some_and(|at| now < at);
            if held {
                return Ok(None);
            }

            entry.lease_token += 1;
            entry.lease_owner = Some(owner.clone());
            entry.lease_expires_at = Some(expires_at);
            Ok(Some(Lease {
                projection: name.to_string(),
                owner: owner.clone(),
                token: entry.lease_token,
                expires_at,
            }))
        })
    }

    fn renew_lease<'a>(&'a self, lease: &'a Lease, ttl: Duration) -> BoxFuture<'a, Result<Lease>> {
        Box::pin(async move {
            let now = self.clock.now();
            let expires_at = self.expiry(ttl);
            let mut entries = self.entries.write().unwrap();
            let entry = entries
                .get_mut(&lease.projection)
                .filter(|e| e.holds(lease, now))
                .ok_or_else(|| ProjectionError::LeaseLost {
                    projection: lease.projection.clone(),
                })?;
            entry.lease_expires_at = Some(expires_at);
            Ok(Lease {
                expires_at,
                ..lease.clone()
            })
        })
    }

    fn release_lease<'a>(&'a self, lease: &'a Lease) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut entries = self.entries.write().unwrap();
            if let Some(entry) = entries.get_mut(&lease.projection) {
                if entry.lease_token == lease.token
                    && entry.lease_owner.as_ref() == Some(&lease.owner)
                {
                    entry.lease_owner = None;
                    entry.lease_expires_at = None;
                }
            }
            Ok(())
        })
    }
}

/// Test harness for projectors providing a fluent testing API.
///
/// # Example
///
/// ```ignore
/// let store = InMemoryProjectionStore::new();
/// let projector = EventTypeCountsProjector::new(store.clone());
/// let mut harness = ProjectionTestHarness::new(projector, store);
///
/// harness
///     .given_events(vec![event1, event2])
///     .await?
///     .then_contains("event_type:TicketReserved.v1")
///     .await?;
/// ```
pub struct ProjectionTestHarness<P: Projector> {
    projector: P,
    store: InMemoryProjectionStore,
}

impl<P: Projector> ProjectionTestHarness<P> {
    /// Create a new test harness for the given projector.
    ///
    /// `store` must be (a clone of) the store the projector writes to.
    #[must_use]
    pub const fn new(projector: P, store: InMemoryProjectionStore) -> Self {
        Self { projector, store }
    }

    /// Apply a series of events to the projector, in order.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if any event fails to apply.
    pub async fn given_events(&mut self, events: Vec<RecordedEvent>) -> Result<&mut Self> {
        for event in &events {
            self.projector.apply(event).await?;
        }
        Ok(self)
    }

    /// Apply a single event to the projector.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the event fails to apply.
    pub async fn given_event(&mut self, event: RecordedEvent) -> Result<&mut Self> {
        self.projector.apply(&event).await?;
        Ok(self)
    }

    /// Reset the projector's read model.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the reset fails.
    pub async fn reset(&mut self) -> Result<&mut Self> {
        self.projector.reset().await?;
        Ok(self)
    }

    /// Assert that the projection store contains the given key.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the query fails.
    ///
    /// # Panics
    ///
    /// Panics if the key is not found in the store (this is a test assertion).
    #[allow(clippy::panic)] // Intentional panic for test assertions
    pub async fn then_contains(&self, key: &str) -> Result<&Self> {
        let exists = self.store.exists(key).await?;
        assert!(
            exists,
            "Expected projection store to contain key '{key}', but it was not found"
        );
        Ok(self)
    }

    /// Assert that the projection store does not contain the given key.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the query fails.
    ///
    /// # Panics
    ///
    /// Panics if the key is found in the store (this is a test assertion).
    #[allow(clippy::panic)] // Intentional panic for test assertions
    pub async fn then_not_contains(&self, key: &str) -> Result<&Self> {
        let exists = self.store.exists(key).await?;
        assert!(
            !exists,
            "Expected projection store to NOT contain key '{key}', but it was found"
        );
        Ok(self)
    }

    /// Get data from the projection store.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the query fails.
    pub async fn get_data(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.store.get(key).await
    }

    /// Get a reference to the underlying projection store.
    #[must_use]
    pub const fn store(&self) -> &InMemoryProjectionStore {
        &self.store
    }

    /// Get a reference to the projector.
    #[must_use]
    pub const fn projector(&self) -> &P {
        &self.projector
    }

    /// Get the number of entries in the projection store.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Check if the projection store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}
