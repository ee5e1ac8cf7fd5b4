//! Atomic counter store contract.
//!
//! The counter store holds one integer per resource and is the only
//! serialization point of the decision path. Every mutation is a single
//! indivisible operation in the store; callers never hold a lock across the
//! round trip.
//!
//! # Bounded decrement
//!
//! [`CounterStore::bounded_decrement`] must refuse to take the counter below
//! zero and must leave the value untouched when it refuses. A plain
//! `DECR` followed by a compensating `INCR` is not acceptable: between the two
//! calls a concurrent reader could observe a negative value.
//!
//! # Compensation
//!
//! [`CounterStore::increment`] never recreates a missing counter and never
//! lifts a counter above the ceiling written by [`CounterStore::set`], so a
//! late compensation cannot push the value past the round's total.
//!
//! # Implementations
//!
//! - `InMemoryCounterStore` in `flashgrab-testing`
//! - `RedisCounterStore` in `flashgrab-redis`

use crate::types::{EventId, ResourceId, UserId};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result of one bounded decrement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decrement {
    /// One unit was taken; `remaining` is the post-decrement value.
    Applied {
        /// Counter value after the decrement.
        remaining: i64,
    },
    /// The counter was already at zero. Nothing was mutated.
    Refused,
    /// The counter was never seeded.
    Missing,
}

/// Errors returned by counter store implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CounterStoreError {
    /// Could not reach the store.
    #[error("Counter store connection failed: {0}")]
    ConnectionFailed(String),

    /// The store answered with something unexpected.
    #[error("Unexpected counter store reply: {0}")]
    UnexpectedReply(String),

    /// Any other store failure.
    #[error("Counter store error: {0}")]
    Other(String),
}

/// Boxed future returned by [`CounterStore`] methods.
pub type CounterFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, CounterStoreError>> + Send + 'a>>;

/// Shared, linearizable per-resource counters plus duplicate-grant markers.
///
/// Methods return explicit boxed futures so the store can be used as
/// `Arc<dyn CounterStore>`.
pub trait CounterStore: Send + Sync {
    /// Take one unit if the counter is above zero.
    ///
    /// # Errors
    ///
    /// Returns [`CounterStoreError`] if the store cannot be reached. The caller
    /// must treat the decrement as indeterminate in that case.
    fn bounded_decrement<'a>(&'a self, resource: &'a ResourceId) -> CounterFuture<'a, Decrement>;

    /// Give one unit back and return the value afterwards.
    ///
    /// Used only to compensate a decrement that did not result in a grant.
    /// A missing counter stays missing (`None`); a counter already at its
    /// ceiling is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`CounterStoreError`] if the store cannot be reached.
    fn increment<'a>(&'a self, resource: &'a ResourceId) -> CounterFuture<'a, Option<i64>>;

    /// Read the current value, `None` when never seeded.
    ///
    /// # Errors
    ///
    /// Returns [`CounterStoreError`] if the store cannot be reached.
    fn get<'a>(&'a self, resource: &'a ResourceId) -> CounterFuture<'a, Option<i64>>;

    /// Overwrite the value and make it the ceiling for [`Self::increment`].
    /// Admin reset only.
    ///
    /// # Errors
    ///
    /// Returns [`CounterStoreError`] if the store cannot be reached.
    fn set<'a>(&'a self, resource: &'a ResourceId, value: i64) -> CounterFuture<'a, ()>;

    /// Overwrite the value only if it still equals `expected` (`None` = absent).
    ///
    /// Returns `true` when the write happened. The reconciler uses this so a
    /// correction computed from a stale read never clobbers grants that raced
    /// with it.
    ///
    /// # Errors
    ///
    /// Returns [`CounterStoreError`] if the store cannot be reached.
    fn compare_and_set<'a>(
        &'a self,
        resource: &'a ResourceId,
        expected: Option<i64>,
        value: i64,
    ) -> CounterFuture<'a, bool>;

    /// Set the duplicate-grant marker for `(resource, user)` to `token` if
    /// absent.
    ///
    /// Returns `true` if this call created the marker, `false` if it already
    /// existed.
    ///
    /// # Errors
    ///
    /// Returns [`CounterStoreError`] if the store cannot be reached. The
    /// marker may have been written anyway.
    fn mark_once<'a>(
        &'a self,
        resource: &'a ResourceId,
        user: &'a UserId,
        token: &'a EventId,
    ) -> CounterFuture<'a, bool>;

    /// Remove the marker of `(resource, user)` only if it still holds `token`.
    ///
    /// Returns `true` if a marker was removed. A marker written by another
    /// request is left in place.
    ///
    /// # Errors
    ///
    /// Returns [`CounterStoreError`] if the store cannot be reached.
    fn clear_marker<'a>(
        &'a self,
        resource: &'a ResourceId,
        user: &'a UserId,
        token: &'a EventId,
    ) -> CounterFuture<'a, bool>;

    /// Remove every duplicate-grant marker of a resource, returning how many
    /// were removed.
    ///
    /// # Errors
    ///
    /// Returns [`CounterStoreError`] if the store cannot be reached.
    fn clear_markers<'a>(&'a self, resource: &'a ResourceId) -> CounterFuture<'a, u64>;
}
