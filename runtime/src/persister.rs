//! Persister: drains the event channel into the ledger.
//!
//! # Pattern: Subscribe-Process-Reconnect Loop
//!
//! ```text
//! loop {
//!     subscribe(topic)
//!         loop {
//!             collect up to batch_size deliveries (wait at most batch_linger
//!             after the first one)
//!             process_batch:
//!                 decode      ─ malformed ─▶ nack, or DLQ + ack after max_deliveries
//!                 apply_batch ─ transient ─▶ retry with backoff, then nack
//!                 ack every delivery that is now durable
//!         }
//!     stream ended or failed: wait, resubscribe
//! }
//! ```
//!
//! A delivery is acknowledged only after its event is durable in the ledger
//! (or parked in the dead-letter queue). Redelivery of an already applied
//! event is harmless: the ledger reports `AlreadyApplied` and it is acked.

use crate::metrics::PersisterMetrics;
use crate::retry::{RetryPolicy, retry_if};
use flashgrab_core::dead_letter::DeadLetterQueue;
use flashgrab_core::event::PipelineEvent;
use flashgrab_core::event_channel::{ChannelError, Delivery, DeliveryStream, EventChannel};
use flashgrab_core::ledger::{ApplyOutcome, Ledger, LedgerError};
use flashgrab_core::stats_cache::StatsCache;
use flashgrab_core::types::UserId;
use futures::StreamExt;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors surfaced by the persister's run loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PersistError {
    /// The ledger rejected a write after all retries.
    #[error("Ledger write failed: {0}")]
    Ledger(#[from] LedgerError),

    /// The channel failed.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
}

/// Persister settings.
#[derive(Debug, Clone)]
pub struct PersisterConfig {
    /// Topic to consume.
    pub topic: String,
    /// Largest batch written in one ledger call.
    pub batch_size: usize,
    /// How long to wait for more deliveries after the first of a batch.
    pub batch_linger: Duration,
    /// Deliveries of an undecodable message before it goes to the DLQ.
    pub max_deliveries: u32,
    /// Local retries of transient ledger failures.
    pub retry: RetryPolicy,
    /// Pause before resubscribing after the stream ended or failed.
    pub reconnect_delay: Duration,
}

impl PersisterConfig {
    /// Defaults for `topic`.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            batch_size: 100,
            batch_linger: Duration::from_millis(20),
            max_deliveries: 5,
            retry: RetryPolicy::default(),
            reconnect_delay: Duration::from_secs(1),
        }
    }

    /// Set the batch size (at least 1).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the batch linger.
    #[must_use]
    pub const fn with_batch_linger(mut self, linger: Duration) -> Self {
        self.batch_linger = linger;
        self
    }

    /// Set the dead-letter threshold (at least 1).
    #[must_use]
    pub fn with_max_deliveries(mut self, max_deliveries: u32) -> Self {
        self.max_deliveries = max_deliveries.max(1);
        self
    }

    /// Set the ledger retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the reconnect delay.
    #[must_use]
    pub const fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

/// What one batch did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Events newly written.
    pub applied: u64,
    /// Events the ledger had already seen.
    pub duplicates: u64,
    /// Malformed deliveries parked in the DLQ.
    pub dead_lettered: u64,
    /// Deliveries handed back for redelivery.
    pub nacked: u64,
}

/// Running totals since the persister was created.
#[derive(Debug, Default)]
pub struct PersisterStats {
    processed: AtomicU64,
    duplicates: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    nacked: AtomicU64,
}

/// Point-in-time copy of [`PersisterStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersisterSnapshot {
    /// Events newly written.
    pub processed: u64,
    /// Redeliveries skipped by idempotency.
    pub duplicates: u64,
    /// Ledger write retries.
    pub retried: u64,
    /// Deliveries parked in the DLQ.
    pub dead_lettered: u64,
    /// Deliveries handed back.
    pub nacked: u64,
}

impl PersisterStats {
    /// Copy the counters.
    #[must_use]
    pub fn snapshot(&self) -> PersisterSnapshot {
        PersisterSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
        }
    }

    fn add(&self, report: &BatchReport) {
        self.processed.fetch_add(report.applied, Ordering::Relaxed);
        self.duplicates.fetch_add(report.duplicates, Ordering::Relaxed);
        self.dead_lettered
            .fetch_add(report.dead_lettered, Ordering::Relaxed);
        self.nacked.fetch_add(report.nacked, Ordering::Relaxed);
    }
}

/// Channel consumer that writes events to the ledger.
pub struct Persister {
    channel: Arc<dyn EventChannel>,
    ledger: Arc<dyn Ledger>,
    dead_letters: Arc<dyn DeadLetterQueue>,
    cache: Option<Arc<dyn StatsCache>>,
    config: PersisterConfig,
    stats: Arc<PersisterStats>,
}

impl Persister {
    /// Create a persister.
    #[must_use]
    pub fn new(
        channel: Arc<dyn EventChannel>,
        ledger: Arc<dyn Ledger>,
        dead_letters: Arc<dyn DeadLetterQueue>,
        config: PersisterConfig,
    ) -> Self {
        Self {
            channel,
            ledger,
            dead_letters,
            cache: None,
            config,
            stats: Arc::new(PersisterStats::default()),
        }
    }

    /// Invalidate user entries in `cache` after each write.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn StatsCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Shared running totals.
    #[must_use]
    pub fn stats(&self) -> Arc<PersisterStats> {
        Arc::clone(&self.stats)
    }

    /// Spawn the consume loop as a background task.
    #[must_use]
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Subscribe and persist until `shutdown` fires.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let topic = self.config.topic.as_str();
        tracing::info!(topic, batch_size = self.config.batch_size, "Persister started");

        loop {
            let subscribed = tokio::select! {
                _ = shutdown.recv() => break,
                subscribed = self.channel.subscribe(topic) => subscribed,
            };

            match subscribed {
                Ok(mut stream) => {
                    tracing::info!(topic, "Persister subscribed");
                    if self.consume(&mut stream, &mut shutdown).await {
                        break;
                    }
                    tracing::warn!(topic, "Event stream ended, resubscribing");
                }
                Err(error) => {
                    tracing::error!(topic, %error, "Subscription failed, retrying");
                }
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                () = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        tracing::info!(topic, stats = ?self.stats.snapshot(), "Persister stopped");
    }

    /// Returns `true` when shutdown was requested.
    async fn consume(
        &self,
        stream: &mut DeliveryStream,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool {
        loop {
            let first = tokio::select! {
                _ = shutdown.recv() => return true,
                next = stream.next() => next,
            };

            let first = match first {
                Some(Ok(delivery)) => delivery,
                Some(Err(error)) => {
                    tracing::error!(%error, "Error receiving from event stream");
                    return false;
                }
                None => return false,
            };

            let mut batch = vec![first];
            let mut ended = false;
            let deadline = tokio::time::Instant::now() + self.config.batch_linger;
            while batch.len() < self.config.batch_size {
                match tokio::time::timeout_at(deadline, stream.next()).await {
                    Ok(Some(Ok(delivery))) => batch.push(delivery),
                    Ok(Some(Err(error))) => {
                        tracing::error!(%error, "Error receiving from event stream");
                        ended = true;
                        break;
                    }
                    Ok(None) => {
                        ended = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            self.process_batch(batch).await;
            if ended {
                return false;
            }
        }
    }

    /// Persist one batch of deliveries and settle each of them.
    pub async fn process_batch(&self, deliveries: Vec<Delivery>) -> BatchReport {
        let started = Instant::now();
        let mut report = BatchReport::default();
        let mut events = Vec::with_capacity(deliveries.len());
        let mut pending = Vec::with_capacity(deliveries.len());

        for delivery in deliveries {
            match PipelineEvent::decode(&delivery.event) {
                Ok(event) => {
                    events.push(event);
                    pending.push(delivery);
                }
                Err(error) => self.handle_malformed(delivery, &error.to_string(), &mut report).await,
            }
        }

        if !events.is_empty() {
            match self.write(&events).await {
                Ok(outcomes) => {
                    self.settle_written(&events, &outcomes, pending, &mut report).await;
                }
                Err(error) if !error.is_transient() && events.len() > 1 => {
                    tracing::warn!(%error, batch = events.len(), "Batch rejected, applying events one by one");
                    self.write_individually(events, pending, &mut report).await;
                }
                Err(error) => {
                    tracing::error!(%error, batch = events.len(), "Ledger write failed, nacking batch");
                    self.nack_all(pending, &mut report).await;
                }
            }
        }

        PersisterMetrics::record_batch(report.applied, report.duplicates, started.elapsed());
        if report.nacked > 0 {
            PersisterMetrics::record_nacks(report.nacked);
        }
        self.stats.add(&report);
        report
    }

    async fn write(&self, events: &[PipelineEvent]) -> Result<Vec<ApplyOutcome>, LedgerError> {
        let mut first = true;
        retry_if(
            &self.config.retry,
            || {
                if !first {
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    PersisterMetrics::record_retry();
                }
                first = false;
                self.ledger.apply_batch(events)
            },
            LedgerError::is_transient,
        )
        .await
    }

    async fn write_individually(
        &self,
        events: Vec<PipelineEvent>,
        pending: Vec<Delivery>,
        report: &mut BatchReport,
    ) {
        for (event, delivery) in events.into_iter().zip(pending) {
            let single = [event];
            match self.write(&single).await {
                Ok(outcomes) => {
                    self.settle_written(&single, &outcomes, vec![delivery], report)
                        .await;
                }
                Err(error) => {
                    tracing::error!(
                        %error,
                        event_id = %single[0].event_id(),
                        "Ledger rejected event, nacking"
                    );
                    self.nack_all(vec![delivery], report).await;
                }
            }
        }
    }

    async fn settle_written(
        &self,
        events: &[PipelineEvent],
        outcomes: &[ApplyOutcome],
        pending: Vec<Delivery>,
        report: &mut BatchReport,
    ) {
        let mut touched: BTreeSet<&UserId> = BTreeSet::new();
        for (event, outcome) in events.iter().zip(outcomes) {
            match outcome {
                ApplyOutcome::Applied => {
                    report.applied += 1;
                    if let PipelineEvent::Grab(grab) = event {
                        touched.insert(&grab.user_id);
                    }
                }
                ApplyOutcome::AlreadyApplied => {
                    report.duplicates += 1;
                    tracing::debug!(event_id = %event.event_id(), "Skipping already applied event");
                }
            }
        }

        if let Some(cache) = &self.cache {
            for user in touched {
                if let Err(error) = cache.invalidate_user(user).await {
                    tracing::warn!(user_id = %user, %error, "Cache invalidation failed");
                }
            }
        }

        for delivery in pending {
            if let Err(error) = delivery.ack().await {
                tracing::warn!(%error, "Ack failed; event will be redelivered and skipped");
            }
        }
    }

    async fn handle_malformed(&self, delivery: Delivery, reason: &str, report: &mut BatchReport) {
        let attempts = delivery.delivery_count;
        if attempts < self.config.max_deliveries {
            tracing::warn!(
                event_type = %delivery.event.event_type,
                attempts,
                max = self.config.max_deliveries,
                reason,
                "Malformed event, nacking"
            );
            self.nack_all(vec![delivery], report).await;
            return;
        }

        match self.dead_letters.add(&delivery.event, reason, attempts).await {
            Ok(dlq_id) => {
                tracing::error!(
                    dlq_id,
                    event_type = %delivery.event.event_type,
                    key = %delivery.event.key,
                    attempts,
                    reason,
                    "Malformed event moved to dead-letter queue"
                );
                PersisterMetrics::record_dead_letter();
                report.dead_lettered += 1;
                if let Err(error) = delivery.ack().await {
                    tracing::warn!(%error, "Ack of dead-lettered event failed");
                }
            }
            Err(error) => {
                tracing::error!(%error, "Dead-letter write failed, nacking");
                self.nack_all(vec![delivery], report).await;
            }
        }
    }

    async fn nack_all(&self, deliveries: Vec<Delivery>, report: &mut BatchReport) {
        for delivery in deliveries {
            report.nacked += 1;
            if let Err(error) = delivery.nack().await {
                tracing::warn!(%error, "Nack failed");
            }
        }
    }
}
