//! Redis-based stock counters.
//!
//! # Bounded decrement
//!
//! ```text
//! GET key ─┬─ nil ──────────► -2  (missing)
//!          ├─ <= 0 ─────────► -1  (refused, value untouched)
//!          └─ > 0 ── DECR ──► new value
//! ```
//!
//! The whole branch runs inside one `EVALSHA`, so no client can observe the
//! counter below zero.
//!
//! # Compensating increment
//!
//! ```text
//! GET key ─┬─ nil ─────────────────► -2  (missing, not recreated)
//!          ├─ >= GET total key ────► value (capped)
//!          └─ otherwise ── INCR ───► new value
//! ```
//!
//! `set` writes the total key next to the counter, so a compensation that
//! arrives after an admin reset cannot lift the counter above the new total.
//!
//! # Markers
//!
//! A marker holds the event id of the attempt that wrote it and is only
//! deleted by that attempt (`GET` + `DEL` in one script).

use crate::is_connection_error;
use flashgrab_core::counter_store::{CounterFuture, CounterStore, CounterStoreError, Decrement};
use flashgrab_core::types::{EventId, ResourceId, UserId};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ErrorKind, RedisError, Script};

const BOUNDED_DECREMENT: &str = r"
local value = redis.call('GET', KEYS[1])
if not value then
    return -2
end
if tonumber(value) <= 0 then
    return -1
end
return redis.call('DECR', KEYS[1])
";

const GUARDED_INCREMENT: &str = r"
local value = redis.call('GET', KEYS[1])
if not value then
    return -2
end
local ceiling = redis.call('GET', KEYS[2])
if ceiling and tonumber(value) >= tonumber(ceiling) then
    return tonumber(value)
end
return redis.call('INCR', KEYS[1])
";

const RELEASE_MARKER: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
";

// ARGV[1] is the expected value, or '' for "key absent".
const COMPARE_AND_SET: &str = r"
local value = redis.call('GET', KEYS[1])
if ARGV[1] == '' then
    if value then
        return 0
    end
elseif not value or tonumber(value) ~= tonumber(ARGV[1]) then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2])
return 1
";

const SCAN_BATCH: usize = 500;

fn map_redis_error(error: &RedisError) -> CounterStoreError {
    if is_connection_error(error) {
        CounterStoreError::ConnectionFailed(error.to_string())
    } else if error.kind() == ErrorKind::TypeError {
        CounterStoreError::UnexpectedReply(error.to_string())
    } else {
        CounterStoreError::Other(error.to_string())
    }
}

/// Escape glob metacharacters so a resource id matches itself in `SCAN MATCH`.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// `Redis`-backed [`CounterStore`].
///
/// # Example
///
/// ```no_run
/// use flashgrab_core::counter_store::{CounterStore, Decrement};
/// use flashgrab_core::types::ResourceId;
/// use flashgrab_redis::{RedisCounterStore, connect};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = RedisCounterStore::new(connect("redis://127.0.0.1:6379").await?);
/// let coupon = ResourceId::new("coupon-101");
///
/// store.set(&coupon, 3).await?;
/// assert_eq!(store.bounded_decrement(&coupon).await?, Decrement::Applied { remaining: 2 });
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisCounterStore {
    conn_manager: ConnectionManager,
    decrement: Script,
    increment: Script,
    compare_and_set: Script,
    release_marker: Script,
}

impl RedisCounterStore {
    /// Create a store on a shared connection manager.
    #[must_use]
    pub fn new(conn_manager: ConnectionManager) -> Self {
        Self {
            conn_manager,
            decrement: Script::new(BOUNDED_DECREMENT),
            increment: Script::new(GUARDED_INCREMENT),
            compare_and_set: Script::new(COMPARE_AND_SET),
            release_marker: Script::new(RELEASE_MARKER),
        }
    }

    fn stock_key(resource: &ResourceId) -> String {
        format!("coupon:{resource}:stock")
    }

    fn total_key(resource: &ResourceId) -> String {
        format!("coupon:{resource}:total")
    }

    fn marker_key(resource: &ResourceId, user: &UserId) -> String {
        format!("coupon:{resource}:grabbed:{user}")
    }

    fn marker_pattern(resource: &ResourceId) -> String {
        format!("coupon:{}:grabbed:*", escape_glob(resource.as_str()))
    }
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore").finish_non_exhaustive()
    }
}

impl CounterStore for RedisCounterStore {
    fn bounded_decrement<'a>(&'a self, resource: &'a ResourceId) -> CounterFuture<'a, Decrement> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let reply: i64 = self
                .decrement
                .key(Self::stock_key(resource))
                .invoke_async(&mut conn)
                .await
                .map_err(|e| map_redis_error(&e))?;

            match reply {
                -2 => Ok(Decrement::Missing),
                -1 => Ok(Decrement::Refused),
                remaining if remaining >= 0 => Ok(Decrement::Applied { remaining }),
                other => Err(CounterStoreError::UnexpectedReply(format!(
                    "bounded decrement returned {other}"
                ))),
            }
        })
    }

    fn increment<'a>(&'a self, resource: &'a ResourceId) -> CounterFuture<'a, Option<i64>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let reply: i64 = self
                .increment
                .key(Self::stock_key(resource))
                .key(Self::total_key(resource))
                .invoke_async(&mut conn)
                .await
                .map_err(|e| map_redis_error(&e))?;

            match reply {
                -2 => Ok(None),
                value if value >= 0 => Ok(Some(value)),
                other => Err(CounterStoreError::UnexpectedReply(format!(
                    "guarded increment returned {other}"
                ))),
            }
        })
    }

    fn get<'a>(&'a self, resource: &'a ResourceId) -> CounterFuture<'a, Option<i64>> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            conn.get(Self::stock_key(resource))
                .await
                .map_err(|e| map_redis_error(&e))
        })
    }

    fn set<'a>(&'a self, resource: &'a ResourceId, value: i64) -> CounterFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let _: () = conn
                .mset(&[
                    (Self::stock_key(resource), value),
                    (Self::total_key(resource), value),
                ])
                .await
                .map_err(|e| map_redis_error(&e))?;
            tracing::debug!(resource = %resource, value, "Counter set");
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
            let mut conn = self.conn_manager.clone();
            let expected = expected.map(|v| v.to_string()).unwrap_or_default();
            let swapped: i64 = self
                .compare_and_set
                .key(Self::stock_key(resource))
                .arg(expected)
                .arg(value)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| map_redis_error(&e))?;
            Ok(swapped == 1)
        })
    }

    fn mark_once<'a>(
        &'a self,
        resource: &'a ResourceId,
        user: &'a UserId,
        token: &'a EventId,
    ) -> CounterFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            conn.set_nx(Self::marker_key(resource, user), token.to_string())
                .await
                .map_err(|e| map_redis_error(&e))
        })
    }

    fn clear_marker<'a>(
        &'a self,
        resource: &'a ResourceId,
        user: &'a UserId,
        token: &'a EventId,
    ) -> CounterFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let removed: i64 = self
                .release_marker
                .key(Self::marker_key(resource, user))
                .arg(token.to_string())
                .invoke_async(&mut conn)
                .await
                .map_err(|e| map_redis_error(&e))?;
            Ok(removed == 1)
        })
    }

    fn clear_markers<'a>(&'a self, resource: &'a ResourceId) -> CounterFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.conn_manager.clone();
            let pattern = Self::marker_pattern(resource);
            let mut cursor: u64 = 0;
            let mut removed: u64 = 0;

            loop {
                let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(SCAN_BATCH)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| map_redis_error(&e))?;

                if !keys.is_empty() {
                    let deleted: u64 = conn.del(&keys).await.map_err(|e| map_redis_error(&e))?;
                    removed += deleted;
                }
                if next == 0 {
                    break;
                }
                cursor = next;
            }

            tracing::info!(resource = %resource, removed, "Duplicate markers cleared");
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connect;

    // Tests marked #[ignore] need a running Redis:
    // docker run -d -p 6379:6379 redis:7-alpine

    #[test]
    fn glob_metacharacters_are_escaped() {
        assert_eq!(escape_glob("coupon-101"), "coupon-101");
        assert_eq!(escape_glob("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
        assert_eq!(
            RedisCounterStore::marker_pattern(&ResourceId::new("vip*")),
            "coupon:vip\\*:grabbed:*"
        );
    }

    #[test]
    fn keys_follow_layout() {
        let coupon = ResourceId::new("coupon-101");
        assert_eq!(RedisCounterStore::stock_key(&coupon), "coupon:coupon-101:stock");
        assert_eq!(RedisCounterStore::total_key(&coupon), "coupon:coupon-101:total");
        assert_eq!(
            RedisCounterStore::marker_key(&coupon, &UserId::new("42")),
            "coupon:coupon-101:grabbed:42"
        );
    }

    async fn store(resource: &ResourceId) -> RedisCounterStore {
        #[allow(clippy::unwrap_used)]
        let store = RedisCounterStore::new(connect("redis://127.0.0.1:6379").await.unwrap());
        let mut conn = store.conn_manager.clone();
        let _: Result<(), _> = conn
            .del(&[
                RedisCounterStore::stock_key(resource),
                RedisCounterStore::total_key(resource),
            ])
            .await;
        store
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn test_bounded_decrement_stops_at_zero() {
        let coupon = ResourceId::new("test-bounded-decrement");
        let store = store(&coupon).await;

        assert_eq!(store.bounded_decrement(&coupon).await.unwrap(), Decrement::Missing);

        store.set(&coupon, 2).await.unwrap();
        assert_eq!(
            store.bounded_decrement(&coupon).await.unwrap(),
            Decrement::Applied { remaining: 1 }
        );
        assert_eq!(
            store.bounded_decrement(&coupon).await.unwrap(),
            Decrement::Applied { remaining: 0 }
        );
        assert_eq!(store.bounded_decrement(&coupon).await.unwrap(), Decrement::Refused);
        assert_eq!(store.get(&coupon).await.unwrap(), Some(0));
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn test_concurrent_decrements_never_oversell() {
        let coupon = ResourceId::new("test-concurrent-decrement");
        let store = store(&coupon).await;
        store.set(&coupon, 50).await.unwrap();

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                let coupon = coupon.clone();
                tokio::spawn(async move { store.bounded_decrement(&coupon).await.unwrap() })
            })
            .collect();

        let mut applied = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), Decrement::Applied { .. }) {
                applied += 1;
            }
        }
        assert_eq!(applied, 50);
        assert_eq!(store.get(&coupon).await.unwrap(), Some(0));
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn test_compare_and_set() {
        let coupon = ResourceId::new("test-compare-and-set");
        let store = store(&coupon).await;

        assert!(store.compare_and_set(&coupon, None, 10).await.unwrap());
        assert!(!store.compare_and_set(&coupon, None, 99).await.unwrap());
        assert!(!store.compare_and_set(&coupon, Some(3), 99).await.unwrap());
        assert!(store.compare_and_set(&coupon, Some(10), 7).await.unwrap());
        assert_eq!(store.get(&coupon).await.unwrap(), Some(7));
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn test_markers_lifecycle() {
        let coupon = ResourceId::new("test-markers");
        let store = store(&coupon).await;
        store.clear_markers(&coupon).await.unwrap();

        let alice = UserId::new("alice");
        let (first, second) = (EventId::new(), EventId::new());
        assert!(store.mark_once(&coupon, &alice, &first).await.unwrap());
        assert!(!store.mark_once(&coupon, &alice, &second).await.unwrap());
        assert!(!store.clear_marker(&coupon, &alice, &second).await.unwrap());
        assert!(store.clear_marker(&coupon, &alice, &first).await.unwrap());
        assert!(store.mark_once(&coupon, &alice, &second).await.unwrap());

        assert!(store.mark_once(&coupon, &UserId::new("bob"), &first).await.unwrap());
        assert_eq!(store.clear_markers(&coupon).await.unwrap(), 2);
        assert!(store.mark_once(&coupon, &alice, &first).await.unwrap());
        store.clear_markers(&coupon).await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires Redis running
    #[allow(clippy::unwrap_used)]
    async fn test_increment_is_guarded() {
        let coupon = ResourceId::new("test-guarded-increment");
        let store = store(&coupon).await;

        assert_eq!(store.increment(&coupon).await.unwrap(), None);
        assert_eq!(store.get(&coupon).await.unwrap(), None);

        store.set(&coupon, 2).await.unwrap();
        assert_eq!(store.increment(&coupon).await.unwrap(), Some(2));
        store.bounded_decrement(&coupon).await.unwrap();
        assert_eq!(store.increment(&coupon).await.unwrap(), Some(2));
    }
}
