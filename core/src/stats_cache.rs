//! Fast tier of the query path.
//!
//! The stats cache holds recently read aggregates so that hot reads do not hit
//! the ledger. It is never authoritative: every entry records when it was
//! cached and readers decide whether it is still fresh enough.
//!
//! A user entry may cache the *absence* of a user (`Cached { value: None, .. }`)
//! so repeated lookups of unknown ids do not fall through to the ledger.

use crate::types::{SystemStats, UserAggregate, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;

/// A cached value and the instant it was written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cached<T> {
    /// The cached value.
    pub value: T,
    /// When the value was read from the ledger.
    pub cached_at: DateTime<Utc>,
}

impl<T> Cached<T> {
    /// Wrap a value read at `cached_at`.
    #[must_use]
    pub const fn new(value: T, cached_at: DateTime<Utc>) -> Self {
        Self { value, cached_at }
    }

    /// Whether the entry is at most `window` old at `now`.
    ///
    /// Entries stamped in the future (clock skew between writers) count as fresh.
    #[must_use]
    pub fn is_fresh(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let age = now.signed_duration_since(self.cached_at);
        age.to_std().map_or(true, |age| age <= window)
    }
}

/// Errors returned by stats cache implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Could not reach the cache.
    #[error("Cache connection failed: {0}")]
    ConnectionFailed(String),

    /// A stored entry could not be decoded.
    #[error("Cache entry corrupt: {0}")]
    Corrupt(String),
}

/// Boxed future returned by [`StatsCache`] methods.
pub type CacheFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CacheError>> + Send + 'a>>;

/// Expiring cache of user and system aggregates.
pub trait StatsCache: Send + Sync {
    /// Cached aggregate of a user. `Some(Cached { value: None, .. })` means the
    /// user is known to have no ledger row.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the cache cannot be read.
    fn get_user<'a>(
        &'a self,
        user: &'a UserId,
    ) -> CacheFuture<'a, Option<Cached<Option<UserAggregate>>>>;

    /// Store a user entry for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the cache cannot be written.
    fn put_user<'a>(
        &'a self,
        user: &'a UserId,
        entry: Cached<Option<UserAggregate>>,
        ttl: Duration,
    ) -> CacheFuture<'a, ()>;

    /// Drop a user entry.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the cache cannot be written.
    fn invalidate_user<'a>(&'a self, user: &'a UserId) -> CacheFuture<'a, ()>;

    /// Cached system totals.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the cache cannot be read.
    fn get_system(&self) -> CacheFuture<'_, Option<Cached<SystemStats>>>;

    /// Store system totals for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError`] if the cache cannot be written.
    fn put_system(&self, entry: Cached<SystemStats>, ttl: Duration) -> CacheFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn freshness_window_is_inclusive() {
        let now = Utc::now();
        let entry = Cached::new(1, now - ChronoDuration::seconds(30));
        assert!(entry.is_fresh(now, Duration::from_secs(30)));
        assert!(!entry.is_fresh(now, Duration::from_secs(29)));
    }

    #[test]
    fn future_entries_are_fresh() {
        let now = Utc::now();
        let entry = Cached::new((), now + ChronoDuration::seconds(5));
        assert!(entry.is_fresh(now, Duration::ZERO));
    }
}
