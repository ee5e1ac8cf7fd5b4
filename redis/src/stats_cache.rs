//! Redis-based stats cache.
//!
//! Entries are bincode-encoded [`Cached`] values written with `SETEX`; Redis
//! expires them on its own. Freshness within the TTL is judged by the reader
//! from `cached_at`.

use crate::is_connection_error;
use flashgrab_core::stats_cache::{CacheError, CacheFuture, Cached, StatsCache};
use flashgrab_core::types::{SystemStats, UserAggregate, UserId};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

const SYSTEM_KEY: &str = "stats:system";

fn map_redis_error(error: &RedisError) -> CacheError {
    if is_connection_error(error) {
        CacheError::ConnectionFailed(error.to_string())
    } else {
        CacheError::Corrupt(error.to_string())
    }
}

/// `Redis`-backed [`StatsCache`].
#[derive(Clone)]
pub struct RedisStatsCache {
    conn_manager: ConnectionManager,
}

impl RedisStatsCache {
    /// Create a cache on a shared connection manager.
    #[must_use]
    pub const fn new(conn_manager: ConnectionManager) -> Self {
        Self { conn_manager }
    }

    fn user_key(user: &UserId) -> String {
        format!("stats:user:{user}")
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let mut conn = self.conn_manager.clone();
        let bytes: Option<Vec<u8>> = conn.get(key).await.map_err(|e| map_redis_error(&e))?;

        match bytes {
            None => Ok(None),
            Some(bytes) => match bincode::deserialize(&bytes) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    // Unreadable entries are dropped so the next read repopulates.
                    tracing::warn!(key, error = %e, "Discarding corrupt cache entry");
                    let _: Result<(), _> = conn.del(key).await;
                    Err(CacheError::Corrupt(e.to_string()))
                },
            },
        }
    }

    async fn write<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let bytes = bincode::serialize(value).map_err(|e| CacheError::Corrupt(e.to_string()))?;
        let seconds = ttl.as_secs().max(1);

        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .set_ex(key, bytes, seconds)
            .await
            .map_err(|e| map_redis_error(&e))?;
        metrics::counter!("stats_cache_writes_total").increment(1);
        Ok(())
    }
}

impl std::fmt::Debug for RedisStatsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStatsCache").finish_non_exhaustive()
    }
}

impl StatsCache for RedisStatsCache {
    fn get_user<'a>(
        &'a self,
        user: &'a UserId,
    ) -> CacheFuture<'a, Option<Cached<Option<UserAggregate>>>> {
        Box::pin(async move { self.read(&Self::user_key(user)).await })
    }

    fn put_user<'a>(
        &'a self,
        user: &'a UserId,
        entry: Cached<Option<UserAggregate>>,
        ttl: Duration,
    ) -> CacheFuture<'a, ()> {
        Box::pin(async move { self.write(&Self::user_key(user), &entry, ttl).await })
    }

    fn invalidate_user<'a>(&'a self, user: &'a UserId) -> CacheFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let _: () = conn
                .del(Self::user_key(user))
                .await
                .map_err(|e| map_redis_error(&e))?;
            Ok(())
        })
    }

    fn get_system(&self) -> CacheFuture<'_, Option<Cached<SystemStats>>> {
        Box::pin(async move { self.read(SYSTEM_KEY).await })
    }

    fn put_system(&self, entry: Cached<SystemStats>, ttl: Duration) -> CacheFuture<'_, ()> {
        Box::pin(async move { self.write(SYSTEM_KEY, &entry, ttl).await })
    }
}
