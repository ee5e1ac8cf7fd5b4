//! In-memory stats cache.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use flashgrab_core::stats_cache::{CacheError, CacheFuture, Cached, StatsCache};
use flashgrab_core::types::{SystemStats, UserAggregate, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type UserEntry = (Cached<Option<UserAggregate>>, Duration);

/// `HashMap`-backed [`StatsCache`].
///
/// Entries never expire on their own; the TTL each entry was written with is
/// kept so tests can assert on it.
#[derive(Clone, Debug, Default)]
pub struct InMemoryStatsCache {
    users: Arc<Mutex<HashMap<UserId, UserEntry>>>,
    system: Arc<Mutex<Option<(Cached<SystemStats>, Duration)>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStatsCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every call until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// TTL a user entry was written with.
    #[must_use]
    pub fn user_ttl(&self, user: &UserId) -> Option<Duration> {
        self.users.lock().unwrap().get(user).map(|(_, ttl)| *ttl)
    }

    /// Whether a user entry exists.
    #[must_use]
    pub fn contains_user(&self, user: &UserId) -> bool {
        self.users.lock().unwrap().contains_key(user)
    }

    /// Write a user entry directly.
    pub fn insert_user(&self, user: &UserId, entry: Cached<Option<UserAggregate>>) {
        self.users
            .lock()
            .unwrap()
            .insert(user.clone(), (entry, Duration::MAX));
    }

    fn check(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::ConnectionFailed(
                "in-memory cache marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

impl StatsCache for InMemoryStatsCache {
    fn get_user<'a>(
        &'a self,
        user: &'a UserId,
    ) -> CacheFuture<'a, Option<Cached<Option<UserAggregate>>>> {
        Box::pin(async move {
            self.check()?;
            Ok(self
                .users
                .lock()
                .unwrap()
                .get(user)
                .map(|(entry, _)| entry.clone()))
        })
    }

    fn put_user<'a>(
        &'a self,
        user: &'a UserId,
        entry: Cached<Option<UserAggregate>>,
        ttl: Duration,
    ) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            self.users.lock().unwrap().insert(user.clone(), (entry, ttl));
            Ok(())
        })
    }

    fn invalidate_user<'a>(&'a self, user: &'a UserId) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            self.check()?;
            self.users.lock().unwrap().remove(user);
            Ok(())
        })
    }

    fn get_system(&self) -> CacheFuture<'_, Option<Cached<SystemStats>>> {
        Box::pin(async move {
            self.check()?;
            Ok(self
                .system
                .lock()
                .unwrap()
                .as_ref()
                .map(|(entry, _)| entry.clone()))
        })
    }

    fn put_system(&self, entry: Cached<SystemStats>, ttl: Duration) -> CacheFuture<'_, ()> {
        Box::pin(async move {
            self.check()?;
            *self.system.lock().unwrap() = Some((entry, ttl));
            Ok(())
        })
    }
}
