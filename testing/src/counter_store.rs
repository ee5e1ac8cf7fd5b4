//! In-memory counter store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use flashgrab_core::counter_store::{CounterFuture, CounterStore, CounterStoreError, Decrement};
use flashgrab_core::types::{EventId, ResourceId, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct Faults {
    unavailable: AtomicBool,
    markers_unavailable: AtomicBool,
    marker_replies_lost: AtomicBool,
    latency: Mutex<Option<Duration>>,
}

/// `HashMap`-backed [`CounterStore`] with fault injection.
///
/// Every operation takes a single mutex, which makes each call linearizable the
/// same way a single-threaded store command is.
///
/// # Example
///
/// ```
/// use flashgrab_core::counter_store::{CounterStore, Decrement};
/// use flashgrab_core::types::ResourceId;
/// use flashgrab_testing::InMemoryCounterStore;
///
/// # tokio_test::block_on(async {
/// let store = InMemoryCounterStore::new();
/// let coupon = ResourceId::new("coupon-1");
/// store.seed(&coupon, 1);
///
/// assert_eq!(store.bounded_decrement(&coupon).await.unwrap(), Decrement::Applied { remaining: 0 });
/// assert_eq!(store.bounded_decrement(&coupon).await.unwrap(), Decrement::Refused);
/// assert_eq!(store.value(&coupon), Some(0));
/// # });
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryCounterStore {
    counters: Arc<Mutex<HashMap<ResourceId, i64>>>,
    ceilings: Arc<Mutex<HashMap<ResourceId, i64>>>,
    markers: Arc<Mutex<HashMap<(ResourceId, UserId), EventId>>>,
    faults: Arc<Faults>,
    decrements: Arc<AtomicU64>,
}

impl InMemoryCounterStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a counter directly, bypassing fault injection.
    pub fn seed(&self, resource: &ResourceId, value: i64) {
        self.counters.lock().unwrap().insert(resource.clone(), value);
    }

    /// Drop a counter, as a store restart without persistence would.
    pub fn forget(&self, resource: &ResourceId) {
        self.counters.lock().unwrap().remove(resource);
    }

    /// Current value, bypassing fault injection.
    #[must_use]
    pub fn value(&self, resource: &ResourceId) -> Option<i64> {
        self.counters.lock().unwrap().get(resource).copied()
    }

    /// Whether a duplicate marker exists.
    #[must_use]
    pub fn has_marker(&self, resource: &ResourceId, user: &UserId) -> bool {
        self.markers
            .lock()
            .unwrap()
            .contains_key(&(resource.clone(), user.clone()))
    }

    /// Number of `bounded_decrement` calls that reached the store.
    #[must_use]
    pub fn decrement_calls(&self) -> u64 {
        self.decrements.load(Ordering::SeqCst)
    }

    /// Make every call fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make only marker calls (`mark_once`) fail.
    pub fn set_markers_unavailable(&self, unavailable: bool) {
        self.faults
            .markers_unavailable
            .store(unavailable, Ordering::SeqCst);
    }

    /// Make `mark_once` write the marker and then fail, as a reply lost after
    /// the store applied the write would.
    pub fn set_marker_replies_lost(&self, lost: bool) {
        self.faults.marker_replies_lost.store(lost, Ordering::SeqCst);
    }

    /// Delay every call by `latency` before it takes effect.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.faults.latency.lock().unwrap() = latency;
    }

    async fn enter(&self) -> Result<(), CounterStoreError> {
        let latency = *self.faults.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(CounterStoreError::ConnectionFailed(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

impl CounterStore for InMemoryCounterStore {
    fn bounded_decrement<'a>(&'a self, resource: &'a ResourceId) -> CounterFuture<'a, Decrement> {
        Box::pin(async move {
            self.enter().await?;
            self.decrements.fetch_add(1, Ordering::SeqCst);
            let mut counters = self.counters.lock().unwrap();
            Ok(match counters.get_mut(resource) {
                None => Decrement::Missing,
                Some(value) if *value <= 0 => Decrement::Refused,
                Some(value) => {
                    *value -= 1;
                    Decrement::Applied { remaining: *value }
                }
            })
        })
    }

    fn increment<'a>(&'a self, resource: &'a ResourceId) -> CounterFuture<'a, Option<i64>> {
        Box::pin(async move {
            self.enter().await?;
            let ceiling = self.ceilings.lock().unwrap().get(resource).copied();
            let mut counters = self.counters.lock().unwrap();
            Ok(counters.get_mut(resource).map(|value| {
                if ceiling.is_none_or(|ceiling| *value < ceiling) {
                    *value += 1;
                }
                *value
            }))
        })
    }

    fn get<'a>(&'a self, resource: &'a ResourceId) -> CounterFuture<'a, Option<i64>> {
        Box::pin(async move {
            self.enter().await?;
            Ok(self.value(resource))
        })
    }

    fn set<'a>(&'a self, resource: &'a ResourceId, value: i64) -> CounterFuture<'a, ()> {
        Box::pin(async move {
            self.enter().await?;
            self.ceilings.lock().unwrap().insert(resource.clone(), value);
            self.seed(resource, value);
            Ok(())
        })
    }

    fn compare_and_set<'a>(
        &'a self,
        resource: &'a ResourceId,
        expected: Option<i64>,
        value: i64,
    ) -> CounterFuture<'a, bool> {
        Box::pin(async move {
            self.enter().await?;
            let mut counters = self.counters.lock().unwrap();
            if counters.get(resource).copied() != expected {
                return Ok(false);
            }
            counters.insert(resource.clone(), value);
            Ok(true)
        })
    }

    fn mark_once<'a>(
        &'a self,
        resource: &'a ResourceId,
        user: &'a UserId,
        token: &'a EventId,
    ) -> CounterFuture<'a, bool> {
        Box::pin(async move {
            self.enter().await?;
            if self.faults.markers_unavailable.load(Ordering::SeqCst) {
                return Err(CounterStoreError::ConnectionFailed(
                    "marker store marked unavailable".to_string(),
                ));
            }
            let created = {
                let mut markers = self.markers.lock().unwrap();
                let key = (resource.clone(), user.clone());
                if markers.contains_key(&key) {
                    false
                } else {
                    markers.insert(key, *token);
                    true
                }
            };
            if self.faults.marker_replies_lost.load(Ordering::SeqCst) {
                return Err(CounterStoreError::ConnectionFailed(
                    "marker reply lost".to_string(),
                ));
            }
            Ok(created)
        })
    }

    fn clear_marker<'a>(
        &'a self,
        resource: &'a ResourceId,
        user: &'a UserId,
        token: &'a EventId,
    ) -> CounterFuture<'a, bool> {
        Box::pin(async move {
            self.enter().await?;
            let mut markers = self.markers.lock().unwrap();
            let key = (resource.clone(), user.clone());
            if markers.get(&key) == Some(token) {
                markers.remove(&key);
                return Ok(true);
            }
            Ok(false)
        })
    }

    fn clear_markers<'a>(&'a self, resource: &'a ResourceId) -> CounterFuture<'a, u64> {
        Box::pin(async move {
            self.enter().await?;
            let mut markers = self.markers.lock().unwrap();
            let before = markers.len();
            markers.retain(|(r, _), _| r != resource);
            Ok((before - markers.len()) as u64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_counter_is_reported() {
        let store = InMemoryCounterStore::new();
        let r = ResourceId::new("nope");
        assert_eq!(store.bounded_decrement(&r).await.unwrap(), Decrement::Missing);
    }

    #[tokio::test]
    async fn compare_and_set_requires_expected_value() {
        let store = InMemoryCounterStore::new();
        let r = ResourceId::new("r");
        assert!(store.compare_and_set(&r, None, 5).await.unwrap());
        assert!(!store.compare_and_set(&r, Some(4), 1).await.unwrap());
        assert!(store.compare_and_set(&r, Some(5), 1).await.unwrap());
        assert_eq!(store.value(&r), Some(1));
    }

    #[tokio::test]
    async fn markers_are_scoped_per_resource() {
        let store = InMemoryCounterStore::new();
        let (a, b) = (ResourceId::new("a"), ResourceId::new("b"));
        let u = UserId::new("u");
        let token = EventId::new();
        assert!(store.mark_once(&a, &u, &token).await.unwrap());
        assert!(!store.mark_once(&a, &u, &token).await.unwrap());
        assert!(store.mark_once(&b, &u, &token).await.unwrap());

        assert_eq!(store.clear_markers(&a).await.unwrap(), 1);
        assert!(!store.has_marker(&a, &u));
        assert!(store.has_marker(&b, &u));
    }

    #[tokio::test]
    async fn marker_is_released_only_by_its_owner() {
        let store = InMemoryCounterStore::new();
        let (r, u) = (ResourceId::new("r"), UserId::new("u"));
        let (owner, other) = (EventId::new(), EventId::new());
        assert!(store.mark_once(&r, &u, &owner).await.unwrap());

        assert!(!store.clear_marker(&r, &u, &other).await.unwrap());
        assert!(store.has_marker(&r, &u));
        assert!(store.clear_marker(&r, &u, &owner).await.unwrap());
        assert!(!store.has_marker(&r, &u));
    }

    #[tokio::test]
    async fn increment_never_creates_or_exceeds_the_round() {
        let store = InMemoryCounterStore::new();
        let r = ResourceId::new("r");
        assert_eq!(store.increment(&r).await.unwrap(), None);
        assert_eq!(store.value(&r), None);

        store.set(&r, 3).await.unwrap();
        assert_eq!(store.increment(&r).await.unwrap(), Some(3));
        store.bounded_decrement(&r).await.unwrap();
        assert_eq!(store.increment(&r).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_call() {
        let store = InMemoryCounterStore::new();
        let r = ResourceId::new("r");
        store.seed(&r, 3);
        store.set_unavailable(true);
        assert!(store.bounded_decrement(&r).await.is_err());
        assert_eq!(store.value(&r), Some(3));
        assert_eq!(store.decrement_calls(), 0);
    }
}
