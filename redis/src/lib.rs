//! Redis backends for the flashgrab pipeline.
//!
//! - [`RedisCounterStore`]: stock counters and duplicate markers. The bounded
//!   decrement, the compensating increment, compare-and-set and marker release
//!   run as Lua scripts so each is one indivisible step on the server.
//! - [`RedisStatsCache`]: bincode-encoded aggregates with per-entry TTLs.
//!
//! # Key layout
//!
//! | Key | Value |
//! |-----|-------|
//! | `coupon:{resource}:stock` | remaining units (integer) |
//! | `coupon:{resource}:total` | ceiling for compensation, written by reset |
//! | `coupon:{resource}:grabbed:{user}` | duplicate marker (event id of the writer) |
//! | `stats:user:{user}` | `Cached<Option<UserAggregate>>` |
//! | `stats:system` | `Cached<SystemStats>` |
//!
//! Both types are cheap to clone and share one [`ConnectionManager`]:
//!
//! ```no_run
//! use flashgrab_redis::{RedisCounterStore, RedisStatsCache, connect};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = connect("redis://127.0.0.1:6379").await?;
//! let counter = RedisCounterStore::new(manager.clone());
//! let cache = RedisStatsCache::new(manager);
//! # Ok(())
//! # }
//! ```

use flashgrab_core::counter_store::CounterStoreError;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};

/// Counter store over Redis strings and Lua scripts.
pub mod counter_store;

/// Stats cache over Redis `SETEX`.
pub mod stats_cache;

pub use counter_store::RedisCounterStore;
pub use stats_cache::RedisStatsCache;

/// Open a [`ConnectionManager`] for `redis_url`.
///
/// The manager reconnects on its own after a dropped connection.
///
/// # Errors
///
/// Returns [`CounterStoreError::ConnectionFailed`] if the URL is invalid or the
/// server is unreachable.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager, CounterStoreError> {
    let client = Client::open(redis_url).map_err(|e| {
        CounterStoreError::ConnectionFailed(format!("Failed to create Redis client: {e}"))
    })?;

    ConnectionManager::new(client).await.map_err(|e| {
        CounterStoreError::ConnectionFailed(format!(
            "Failed to create Redis connection manager: {e}"
        ))
    })
}

/// Whether a redis failure is about reaching the server rather than the command.
pub(crate) fn is_connection_error(error: &RedisError) -> bool {
    error.is_io_error()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
        || error.is_timeout()
}
