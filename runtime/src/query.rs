//! Two-tier read path.
//!
//! | Query          | Fast tier                    | Fallback                         |
//! |----------------|------------------------------|----------------------------------|
//! | `stock`        | counter store                | `stock_config.remaining`/`total` |
//! | `user_stats`   | stats cache (fresh entries)  | ledger, then repopulate cache    |
//! | `system_stats` | stats cache (fresh entries)  | ledger, then repopulate cache    |
//!
//! A cache entry older than [`QueryConfig::freshness`] is a miss even if the
//! cache still holds it. Cache failures degrade to the ledger; cache writes
//! are best-effort. Unknown users are cached too (short TTL) so repeated
//! lookups of ids that do not exist stay off the ledger.

use crate::metrics::QueryMetrics;
use flashgrab_core::counter_store::CounterStore;
use flashgrab_core::environment::Clock;
use flashgrab_core::ledger::{Ledger, LedgerError};
use flashgrab_core::stats_cache::{Cached, StatsCache};
use flashgrab_core::types::{ResourceId, SystemStats, UserAggregate, UserId};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the query service.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    /// Neither tier knows the resource.
    #[error("Resource not configured: {0}")]
    NotConfigured(ResourceId),

    /// The ledger fallback failed.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),
}

/// Which tier produced an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Live counter store.
    Counter,
    /// Stats cache.
    Cache,
    /// Durable ledger.
    Ledger,
}

impl Tier {
    /// Metric label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Cache => "cache",
            Self::Ledger => "ledger",
        }
    }
}

/// A query result and the tier that served it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer<T> {
    /// The result.
    pub value: T,
    /// Where it came from.
    pub tier: Tier,
}

/// Remaining stock of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLevel {
    /// Resource id.
    pub resource_id: ResourceId,
    /// Units not yet granted.
    pub remaining: i64,
    /// Tier that answered.
    pub tier: Tier,
}

/// Totals across all users plus per-resource stock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemOverview {
    /// Aggregated totals.
    pub stats: SystemStats,
    /// Stock of every tracked resource.
    pub stock: Vec<StockLevel>,
}

/// Cache policy.
#[derive(Debug, Clone, Copy)]
pub struct QueryConfig {
    /// Oldest cache entry still served.
    pub freshness: Duration,
    /// TTL of an "unknown user" entry.
    pub negative_ttl: Duration,
    /// Base TTL of a populated entry.
    pub positive_ttl: Duration,
    /// Upper bound of the random extra TTL added to populated entries.
    pub ttl_jitter: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            freshness: Duration::from_secs(30),
            negative_ttl: Duration::from_secs(60),
            positive_ttl: Duration::from_secs(3600),
            ttl_jitter: Duration::from_secs(300),
        }
    }
}

impl QueryConfig {
    fn positive_ttl(&self) -> Duration {
        let jitter_ms = u64::try_from(self.ttl_jitter.as_millis()).unwrap_or(u64::MAX);
        let extra = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.positive_ttl + Duration::from_millis(extra)
    }
}

/// Read-side service.
pub struct QueryService {
    counter: Arc<dyn CounterStore>,
    ledger: Arc<dyn Ledger>,
    cache: Option<Arc<dyn StatsCache>>,
    clock: Arc<dyn Clock>,
    resources: Vec<ResourceId>,
    config: QueryConfig,
}

impl QueryService {
    /// Create a service without a cache tier. `resources` are listed by
    /// [`Self::system_stats`].
    #[must_use]
    pub fn new(
        counter: Arc<dyn CounterStore>,
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
        resources: Vec<ResourceId>,
        config: QueryConfig,
    ) -> Self {
        Self {
            counter,
            ledger,
            cache: None,
            clock,
            resources,
            config,
        }
    }

    /// Add the stats cache tier.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn StatsCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Remaining stock of a resource.
    ///
    /// # Errors
    ///
    /// - [`QueryError::NotConfigured`] if neither tier knows the resource
    /// - [`QueryError::Ledger`] if the counter missed and the ledger failed
    pub async fn stock(&self, resource: &ResourceId) -> Result<StockLevel, QueryError> {
        match self.counter.get(resource).await {
            Ok(Some(remaining)) => {
                QueryMetrics::record_tier("stock", Tier::Counter.as_str());
                return Ok(StockLevel {
                    resource_id: resource.clone(),
                    remaining: remaining.max(0),
                    tier: Tier::Counter,
                });
            }
            Ok(None) => {
                tracing::debug!(resource_id = %resource, "Counter missing, reading ledger");
            }
            Err(error) => {
                tracing::warn!(resource_id = %resource, %error, "Counter read failed, reading ledger");
            }
        }

        let config = self
            .ledger
            .stock_config(resource)
            .await?
            .ok_or_else(|| QueryError::NotConfigured(resource.clone()))?;
        QueryMetrics::record_tier("stock", Tier::Ledger.as_str());
        Ok(StockLevel {
            resource_id: resource.clone(),
            remaining: config.seed_value(),
            tier: Tier::Ledger,
        })
    }

    /// Aggregate of one user; `None` if the user never grabbed.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::Ledger`] if the cache missed and the ledger failed.
    pub async fn user_stats(
        &self,
        user: &UserId,
    ) -> Result<Answer<Option<UserAggregate>>, QueryError> {
        let now = self.clock.now();

        if let Some(cache) = &self.cache {
            match cache.get_user(user).await {
                Ok(Some(entry)) if entry.is_fresh(now, self.config.freshness) => {
                    QueryMetrics::record_tier("user_stats", Tier::Cache.as_str());
                    return Ok(Answer {
                        value: entry.value,
                        tier: Tier::Cache,
                    });
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(user_id = %user, %error, "Cache read failed, reading ledger");
                }
            }
        }

        let aggregate = self.ledger.user_aggregate(user).await?;
        QueryMetrics::record_tier("user_stats", Tier::Ledger.as_str());

        if let Some(cache) = &self.cache {
            let ttl = if aggregate.is_some() {
                self.config.positive_ttl()
            } else {
                self.config.negative_ttl
            };
            if let Err(error) = cache
                .put_user(user, Cached::new(aggregate.clone(), now), ttl)
                .await
            {
                tracing::warn!(user_id = %user, %error, "Cache write failed");
            }
        }

        Ok(Answer {
            value: aggregate,
            tier: Tier::Ledger,
        })
    }

    /// System totals plus stock of every tracked resource.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError`] if a tier needed for the answer failed.
    pub async fn system_stats(&self) -> Result<Answer<SystemOverview>, QueryError> {
        let (stats, tier) = self.system_totals().await?;

        let mut stock = Vec::with_capacity(self.resources.len());
        for resource in &self.resources {
            match self.stock(resource).await {
                Ok(level) => stock.push(level),
                Err(QueryError::NotConfigured(_)) => {
                    tracing::debug!(resource_id = %resource, "Tracked resource not configured");
                }
                Err(error) => return Err(error),
            }
        }

        Ok(Answer {
            value: SystemOverview { stats, stock },
            tier,
        })
    }

    async fn system_totals(&self) -> Result<(SystemStats, Tier), QueryError> {
        let now = self.clock.now();

        if let Some(cache) = &self.cache {
            match cache.get_system().await {
                Ok(Some(entry)) if entry.is_fresh(now, self.config.freshness) => {
                    QueryMetrics::record_tier("system_stats", Tier::Cache.as_str());
                    return Ok((entry.value, Tier::Cache));
                }
                Ok(_) => {}
                Err(error) => tracing::warn!(%error, "Cache read failed, reading ledger"),
            }
        }

        let stats = self.ledger.system_stats().await?;
        QueryMetrics::record_tier("system_stats", Tier::Ledger.as_str());

        if let Some(cache) = &self.cache {
            let entry = Cached::new(stats.clone(), now);
            if let Err(error) = cache.put_system(entry, self.config.positive_ttl()).await {
                tracing::warn!(%error, "Cache write failed");
            }
        }

        Ok((stats, Tier::Ledger))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flashgrab_core::ledger::Ledger;
    use flashgrab_core::types::{EventId, GrabEvent, Outcome};
    use flashgrab_testing::{
        FixedClock, InMemoryCounterStore, InMemoryLedger, InMemoryStatsCache, test_clock,
    };

    struct Fixture {
        service: QueryService,
        counter: InMemoryCounterStore,
        ledger: InMemoryLedger,
        cache: InMemoryStatsCache,
        clock: FixedClock,
    }

    fn fixture() -> Fixture {
        let counter = InMemoryCounterStore::new();
        let ledger = InMemoryLedger::with_stock(&[("coupon", 10)]);
        let cache = InMemoryStatsCache::new();
        let clock = test_clock();
        let service = QueryService::new(
            Arc::new(counter.clone()),
            Arc::new(ledger.clone()),
            Arc::new(clock.clone()),
            vec![ResourceId::new("coupon")],
            QueryConfig::default(),
        )
        .with_cache(Arc::new(cache.clone()));
        Fixture {
            service,
            counter,
            ledger,
            cache,
            clock,
        }
    }

    async fn grab(ledger: &InMemoryLedger, user: &str) {
        ledger
            .apply_grab(&GrabEvent {
                event_id: EventId::new(),
                user_id: UserId::new(user),
                resource_id: ResourceId::new("coupon"),
                outcome: Outcome::Granted,
                stock_snapshot: 9,
                occurred_at: Utc::now(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stock_prefers_the_counter() {
        let f = fixture();
        f.counter.seed(&ResourceId::new("coupon"), 7);
        let level = f.service.stock(&ResourceId::new("coupon")).await.unwrap();
        assert_eq!((level.remaining, level.tier), (7, Tier::Counter));
    }

    #[tokio::test]
    async fn stock_falls_back_to_ledger_when_counter_missing_or_down() {
        let f = fixture();
        let level = f.service.stock(&ResourceId::new("coupon")).await.unwrap();
        assert_eq!((level.remaining, level.tier), (10, Tier::Ledger));

        f.counter.seed(&ResourceId::new("coupon"), 7);
        f.counter.set_unavailable(true);
        let level = f.service.stock(&ResourceId::new("coupon")).await.unwrap();
        assert_eq!(level.tier, Tier::Ledger);
    }

    #[tokio::test]
    async fn unknown_resource_is_not_configured() {
        let f = fixture();
        let missing = ResourceId::new("nope");
        assert_eq!(
            f.service.stock(&missing).await,
            Err(QueryError::NotConfigured(missing))
        );
    }

    #[tokio::test]
    async fn user_stats_repopulates_then_serves_from_cache() {
        let f = fixture();
        grab(&f.ledger, "alice").await;
        let alice = UserId::new("alice");

        let first = f.service.user_stats(&alice).await.unwrap();
        assert_eq!(first.tier, Tier::Ledger);
        assert_eq!(first.value.as_ref().unwrap().successful_grants, 1);

        let second = f.service.user_stats(&alice).await.unwrap();
        assert_eq!(second.tier, Tier::Cache);
        assert_eq!(second.value, first.value);

        let ttl = f.cache.user_ttl(&alice).unwrap();
        assert!(ttl >= Duration::from_secs(3600) && ttl <= Duration::from_secs(3900));
    }

    #[tokio::test]
    async fn unknown_user_is_negatively_cached() {
        let f = fixture();
        let ghost = UserId::new("ghost");

        let answer = f.service.user_stats(&ghost).await.unwrap();
        assert_eq!(answer.value, None);
        assert_eq!(f.cache.user_ttl(&ghost), Some(Duration::from_secs(60)));

        let again = f.service.user_stats(&ghost).await.unwrap();
        assert_eq!((again.value, again.tier), (None, Tier::Cache));
    }

    #[tokio::test]
    async fn stale_entry_is_a_miss() {
        let f = fixture();
        let alice = UserId::new("alice");
        f.service.user_stats(&alice).await.unwrap();

        grab(&f.ledger, "alice").await;
        f.clock.advance(chrono::Duration::seconds(31));

        let answer = f.service.user_stats(&alice).await.unwrap();
        assert_eq!(answer.tier, Tier::Ledger);
        assert_eq!(answer.value.unwrap().total_attempts, 1);
    }

    #[tokio::test]
    async fn cache_outage_degrades_to_ledger() {
        let f = fixture();
        grab(&f.ledger, "alice").await;
        f.cache.set_unavailable(true);

        let answer = f.service.user_stats(&UserId::new("alice")).await.unwrap();
        assert_eq!(answer.tier, Tier::Ledger);
        assert!(answer.value.is_some());
    }

    #[tokio::test]
    async fn system_stats_combine_totals_and_live_stock() {
        let f = fixture();
        grab(&f.ledger, "alice").await;
        grab(&f.ledger, "bob").await;
        f.counter.seed(&ResourceId::new("coupon"), 8);

        let answer = f.service.system_stats().await.unwrap();
        assert_eq!(answer.tier, Tier::Ledger);
        assert_eq!(answer.value.stats.successful_grants, 2);
        assert_eq!(answer.value.stats.distinct_users, 2);
        assert_eq!(answer.value.stock.len(), 1);
        assert_eq!(answer.value.stock[0].remaining, 8);

        let cached = f.service.system_stats().await.unwrap();
        assert_eq!(cached.tier, Tier::Cache);
    }

    #[tokio::test]
    async fn ledger_outage_surfaces_on_miss() {
        let f = fixture();
        f.ledger.set_unavailable(true);
        let result = f.service.user_stats(&UserId::new("alice")).await;
        assert!(matches!(result, Err(QueryError::Ledger(_))));
    }
}
