//! Application wiring and lifecycle.
//!
//! [`App::build`] connects the production backends; [`App::assemble`] wires
//! any set of [`Backends`] into the services, seeds missing configuration and
//! counters, and starts the background tasks.

use crate::config::{Config, ResourceSpec};
use flashgrab_core::counter_store::CounterStore;
use flashgrab_core::dead_letter::DeadLetterQueue;
use flashgrab_core::environment::{Clock, SystemClock};
use flashgrab_core::event_channel::EventChannel;
use flashgrab_core::ledger::{Ledger, LedgerError};
use flashgrab_core::stats_cache::StatsCache;
use flashgrab_core::types::StockConfig;
use flashgrab_postgres::{PostgresDeadLetterQueue, PostgresLedger};
use flashgrab_redis::{RedisCounterStore, RedisStatsCache};
use flashgrab_redpanda::RedpandaEventChannel;
use flashgrab_runtime::admin::Seeded;
use flashgrab_runtime::persister::PersisterStats;
use flashgrab_runtime::{
    Admin, AdminError, CouponApi, DecisionGateway, EventPublisher, GatewayConfig, Persister,
    PersisterConfig, PublisherConfig, QueryConfig, QueryService, Reconciler, ReconcilerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Application errors
#[derive(Error, Debug)]
pub enum AppError {
    /// Ledger connection, migration or configuration write failed
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Counter store or cache connection failed
    #[error("Redis error: {0}")]
    Redis(String),

    /// Event channel could not be created
    #[error("Event channel error: {0}")]
    Channel(String),

    /// Counter seeding failed
    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] AdminError),
}

/// The stores a running worker talks to.
pub struct Backends {
    /// Live stock counters and duplicate markers
    pub counter: Arc<dyn CounterStore>,
    /// Durable ledger
    pub ledger: Arc<dyn Ledger>,
    /// Dead-letter queue
    pub dead_letters: Arc<dyn DeadLetterQueue>,
    /// Event channel between gateway and persister
    pub channel: Arc<dyn EventChannel>,
    /// Read-path cache, if any
    pub cache: Option<Arc<dyn StatsCache>>,
}

/// A running worker.
pub struct App {
    api: CouponApi,
    persister_stats: Arc<PersisterStats>,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl App {
    /// Connect to `PostgreSQL`, Redis and Redpanda, then [`Self::assemble`].
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] if a backend is unreachable, migrations fail, or
    /// a configured resource cannot be seeded.
    #[allow(clippy::cognitive_complexity)]
    pub async fn build(config: &Config) -> Result<Self, AppError> {
        tracing::info!("Connecting to PostgreSQL...");
        let ledger =
            PostgresLedger::connect(&config.postgres.url, config.postgres.max_connections).await?;
        tracing::info!("Running ledger migrations...");
        ledger.migrate().await?;
        let dead_letters = PostgresDeadLetterQueue::new(ledger.pool().clone());
        tracing::info!("✓ Ledger ready");

        tracing::info!(url = %config.redis.url, "Connecting to Redis...");
        let conn_manager = flashgrab_redis::connect(&config.redis.url)
            .await
            .map_err(|e| AppError::Redis(e.to_string()))?;
        let counter = RedisCounterStore::new(conn_manager.clone());
        let cache = RedisStatsCache::new(conn_manager);
        tracing::info!("✓ Counter store ready");

        tracing::info!(brokers = %config.redpanda.brokers, "Connecting to Redpanda...");
        let channel = RedpandaEventChannel::builder()
            .brokers(&config.redpanda.brokers)
            .consumer_group(&config.redpanda.consumer_group)
            .build()
            .map_err(|e| AppError::Channel(e.to_string()))?;
        tracing::info!("✓ Event channel ready");

        let backends = Backends {
            counter: Arc::new(counter),
            ledger: Arc::new(ledger),
            dead_letters: Arc::new(dead_letters),
            channel: Arc::new(channel),
            cache: Some(Arc::new(cache)),
        };
        Self::assemble(config, backends, Arc::new(SystemClock)).await
    }

    /// Wire the services on top of `backends` and start the background tasks.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] if configuration rows cannot be written or a
    /// configured resource cannot be seeded.
    pub async fn assemble(
        config: &Config,
        backends: Backends,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        let Backends {
            counter,
            ledger,
            dead_letters,
            channel,
            cache,
        } = backends;
        let resources = config.resource_ids();

        ensure_stock_configs(ledger.as_ref(), &config.resources).await?;

        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&counter),
            Arc::clone(&ledger),
            Arc::clone(&clock),
            ReconcilerConfig {
                tolerance: config.reconciler.tolerance,
                ..ReconcilerConfig::default()
            },
        ));
        let admin = Arc::new(Admin::new(
            Arc::clone(&counter),
            Arc::clone(&ledger),
            Arc::clone(&reconciler),
            Arc::clone(&clock),
        ));

        for (resource, seeded) in admin.bootstrap(&resources).await? {
            match seeded {
                Seeded::Created(value) => {
                    tracing::info!(resource_id = %resource, value, "✓ Counter seeded");
                }
                Seeded::Existing(live) => {
                    tracing::info!(resource_id = %resource, live, "✓ Counter kept");
                }
            }
        }

        let (shutdown, _) = broadcast::channel(1);
        let mut tasks = Vec::with_capacity(3);

        let (publisher, publisher_task) = EventPublisher::spawn(
            Arc::clone(&channel),
            PublisherConfig::new(config.redpanda.topic.clone())
                .with_buffer(config.gateway.publish_buffer),
            shutdown.subscribe(),
        );
        tasks.push(("publisher", publisher_task));

        let gateway = DecisionGateway::new(
            Arc::clone(&counter),
            publisher,
            Arc::clone(&clock),
            GatewayConfig {
                duplicate_protection: config.gateway.duplicate_protection,
                publish_denials: config.gateway.publish_denials,
                counter_timeout: config.counter_timeout(),
                ..GatewayConfig::default()
            },
        );

        let mut persister = Persister::new(
            channel,
            Arc::clone(&ledger),
            dead_letters,
            PersisterConfig::new(config.redpanda.topic.clone())
                .with_batch_size(config.persister.batch_size)
                .with_max_deliveries(config.persister.max_deliveries),
        );
        if let Some(cache) = &cache {
            persister = persister.with_cache(Arc::clone(cache));
        }
        let persister_stats = persister.stats();
        tasks.push(("persister", persister.spawn(shutdown.subscribe())));

        tasks.push((
            "reconciler",
            Arc::clone(&reconciler).spawn_periodic(
                resources.clone(),
                config.reconcile_interval(),
                shutdown.subscribe(),
            ),
        ));

        let mut query = QueryService::new(
            counter,
            ledger,
            clock,
            resources,
            QueryConfig {
                freshness: Duration::from_secs(config.query.cache_freshness_secs),
                ..QueryConfig::default()
            }
        );
        if let Some(cache) = cache {
            query = query.with_cache(cache);
        }

        tracing::info!(
            resources = config.resources.len(),
            topic = %config.redpanda.topic,
            "✓ Worker started"
        );

        Ok(Self {
            api: CouponApi::new(gateway, Arc::new(query), admin),
            persister_stats,
            shutdown,
            tasks,
        })
    }

    /// The public API of this worker.
    #[must_use]
    pub const fn api(&self) -> &CouponApi {
        &self.api
    }

    /// Persister running totals.
    #[must_use]
    pub fn persister_stats(&self) -> Arc<PersisterStats> {
        Arc::clone(&self.persister_stats)
    }

    /// Signal every background task to stop and wait up to `timeout` for them.
    ///
    /// The publisher flushes its buffer before exiting; tasks still running
    /// at the deadline are aborted.
    pub async fn shutdown(self, timeout: Duration) {
        tracing::info!("Shutting down worker...");
        let _ = self.shutdown.send(());

        let deadline = tokio::time::Instant::now() + timeout;
        for (name, mut task) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => tracing::info!(task = name, "✓ Task stopped"),
                Ok(Err(error)) => tracing::error!(task = name, %error, "Task panicked"),
                Err(_) => {
                    tracing::warn!(task = name, "Task did not stop in time, aborting");
                    task.abort();
                }
            }
        }

        let totals = self.persister_stats.snapshot();
        tracing::info!(
            processed = totals.processed,
            duplicates = totals.duplicates,
            dead_lettered = totals.dead_lettered,
            "Worker stopped"
        );
    }
}

/// Create a `stock_config` row for every `id=total` resource that has none.
///
/// Existing rows are left alone so that a restart never undoes a reset.
///
/// # Errors
///
/// Returns [`LedgerError`] if a lookup or insert fails.
pub async fn ensure_stock_configs(
    ledger: &dyn Ledger,
    resources: &[ResourceSpec],
) -> Result<(), LedgerError> {
    for spec in resources {
        let Some(total) = spec.total else { continue };
        let resource = spec.resource_id();
        if ledger.stock_config(&resource).await?.is_none() {
            ledger
                .put_stock_config(&StockConfig::new(resource.clone(), total))
                .await?;
            tracing::info!(resource_id = %resource, total, "Stock configuration created");
        }
    }
    Ok(())
}
