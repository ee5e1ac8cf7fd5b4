//! In-memory ledger and dead-letter queue.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use chrono::{DateTime, Utc};
use flashgrab_core::dead_letter::{DLQStatus, DeadLetterQueue, FailedEvent};
use flashgrab_core::event::{PipelineEvent, SerializedEvent};
use flashgrab_core::ledger::{ApplyOutcome, Ledger, LedgerError, LedgerFuture};
use flashgrab_core::types::{
    DriftCorrection, EventId, GrabEvent, LikeEvent, ResourceId, StockConfig, SystemStats,
    UserAggregate, UserId,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Like totals of one user.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LikeTotals {
    /// All likes.
    pub total_likes: i64,
    /// Likes promoted to the top board.
    pub top_likes: i64,
    /// Latest like.
    pub last_like_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct LedgerState {
    grab_events: HashMap<EventId, GrabEvent>,
    aggregates: HashMap<UserId, UserAggregate>,
    processed: HashSet<EventId>,
    likes: HashMap<UserId, LikeTotals>,
    stock: HashMap<ResourceId, StockConfig>,
    drift_log: Vec<DriftCorrection>,
}

impl LedgerState {
    fn apply_grab(&mut self, event: &GrabEvent) -> ApplyOutcome {
        if self.grab_events.contains_key(&event.event_id) {
            return ApplyOutcome::AlreadyApplied;
        }
        self.grab_events.insert(event.event_id, event.clone());
        self.aggregates
            .entry(event.user_id.clone())
            .or_insert_with(|| UserAggregate::empty(event.user_id.clone()))
            .record(event);
        ApplyOutcome::Applied
    }

    fn apply_like(&mut self, event: &LikeEvent) -> ApplyOutcome {
        if !self.processed.insert(event.event_id) {
            return ApplyOutcome::AlreadyApplied;
        }
        let totals = self.likes.entry(event.user_id.clone()).or_default();
        totals.total_likes += 1;
        if event.is_top_like {
            totals.top_likes += 1;
        }
        totals.last_like_at = Some(
            totals
                .last_like_at
                .map_or(event.occurred_at, |last| last.max(event.occurred_at)),
        );
        ApplyOutcome::Applied
    }
}

/// `HashMap`-backed [`Ledger`] with write-failure injection.
#[derive(Clone, Debug, Default)]
pub struct InMemoryLedger {
    state: Arc<Mutex<LedgerState>>,
    failing_writes: Arc<AtomicUsize>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ledger with stock rows for `(resource, total)` pairs.
    #[must_use]
    pub fn with_stock(resources: &[(&str, i64)]) -> Self {
        let ledger = Self::new();
        for (resource, total) in resources {
            ledger.insert_stock(StockConfig::new(ResourceId::new(*resource), *total));
        }
        ledger
    }

    /// Insert a stock row directly.
    pub fn insert_stock(&self, config: StockConfig) {
        self.state
            .lock()
            .unwrap()
            .stock
            .insert(config.resource_id.clone(), config);
    }

    /// Fail the next `n` write calls with a transient error.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Fail every call until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of grab history rows.
    #[must_use]
    pub fn grab_event_count(&self) -> usize {
        self.state.lock().unwrap().grab_events.len()
    }

    /// Number of distinct users with an aggregate.
    #[must_use]
    pub fn aggregate_count(&self) -> usize {
        self.state.lock().unwrap().aggregates.len()
    }

    /// Like totals of a user.
    #[must_use]
    pub fn like_totals(&self, user: &UserId) -> Option<LikeTotals> {
        self.state.lock().unwrap().likes.get(user).cloned()
    }

    /// Stock row, bypassing fault injection.
    #[must_use]
    pub fn stock_row(&self, resource: &ResourceId) -> Option<StockConfig> {
        self.state.lock().unwrap().stock.get(resource).cloned()
    }

    /// Audit log of drift corrections.
    #[must_use]
    pub fn drift_log(&self) -> Vec<DriftCorrection> {
        self.state.lock().unwrap().drift_log.clone()
    }

    fn check_read(&self) -> Result<(), LedgerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::ConnectionFailed(
                "in-memory ledger marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), LedgerError> {
        self.check_read()?;
        let injected = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(LedgerError::DatabaseError("injected write failure".to_string()));
        }
        Ok(())
    }
}

impl Ledger for InMemoryLedger {
    fn apply_grab<'a>(&'a self, event: &'a GrabEvent) -> LedgerFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            self.check_write()?;
            Ok(self.state.lock().unwrap().apply_grab(event))
        })
    }

    fn apply_like<'a>(&'a self, event: &'a LikeEvent) -> LedgerFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            self.check_write()?;
            Ok(self.state.lock().unwrap().apply_like(event))
        })
    }

    fn apply_batch<'a>(
        &'a self,
        events: &'a [PipelineEvent],
    ) -> LedgerFuture<'a, Vec<ApplyOutcome>> {
        Box::pin(async move {
            self.check_write()?;
            let mut state = self.state.lock().unwrap();
            Ok(events
                .iter()
                .map(|event| match event {
                    PipelineEvent::Grab(grab) => state.apply_grab(grab),
                    PipelineEvent::Like(like) => state.apply_like(like),
                })
                .collect())
        })
    }

    fn count_granted<'a>(&'a self, resource: &'a ResourceId) -> LedgerFuture<'a, i64> {
        Box::pin(async move {
            self.check_read()?;
            let state = self.state.lock().unwrap();
            let since = state
                .stock
                .get(resource)
                .and_then(|config| config.round_started_at);
            let count = state
                .grab_events
                .values()
                .filter(|e| &e.resource_id == resource && e.outcome.is_granted())
                .filter(|e| since.is_none_or(|since| e.occurred_at >= since))
                .count();
            Ok(i64::try_from(count).unwrap_or(i64::MAX))
        })
    }

    fn stock_config<'a>(
        &'a self,
        resource: &'a ResourceId,
    ) -> LedgerFuture<'a, Option<StockConfig>> {
        Box::pin(async move {
            self.check_read()?;
            Ok(self.stock_row(resource))
        })
    }

    fn stock_configs(&self) -> LedgerFuture<'_, Vec<StockConfig>> {
        Box::pin(async move {
            self.check_read()?;
            let mut configs: Vec<_> = self.state.lock().unwrap().stock.values().cloned().collect();
            configs.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
            Ok(configs)
        })
    }

    fn put_stock_config<'a>(&'a self, config: &'a StockConfig) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            self.check_write()?;
            self.insert_stock(config.clone());
            Ok(())
        })
    }

    fn set_remaining<'a>(
        &'a self,
        resource: &'a ResourceId,
        remaining: i64,
    ) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            self.check_write()?;
            let mut state = self.state.lock().unwrap();
            let row = state
                .stock
                .get_mut(resource)
                .ok_or_else(|| LedgerError::NotConfigured(resource.to_string()))?;
            row.remaining = Some(remaining);
            Ok(())
        })
    }

    fn user_aggregate<'a>(
        &'a self,
        user: &'a UserId,
    ) -> LedgerFuture<'a, Option<UserAggregate>> {
        Box::pin(async move {
            self.check_read()?;
            Ok(self.state.lock().unwrap().aggregates.get(user).cloned())
        })
    }

    fn system_stats(&self) -> LedgerFuture<'_, SystemStats> {
        Box::pin(async move {
            self.check_read()?;
            let state = self.state.lock().unwrap();
            let mut stats = SystemStats {
                distinct_users: i64::try_from(state.aggregates.len()).unwrap_or(i64::MAX),
                ..SystemStats::default()
            };
            for agg in state.aggregates.values() {
                stats.total_attempts += agg.total_attempts;
                stats.successful_grants += agg.successful_grants;
                stats.failed_attempts += agg.failed_attempts;
            }
            for likes in state.likes.values() {
                stats.total_likes += likes.total_likes;
                stats.top_likes += likes.top_likes;
            }
            Ok(stats)
        })
    }

    fn record_drift<'a>(&'a self, correction: &'a DriftCorrection) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            self.check_write()?;
            self.state.lock().unwrap().drift_log.push(correction.clone());
            Ok(())
        })
    }
}

/// `Vec`-backed [`DeadLetterQueue`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryDeadLetterQueue {
    entries: Arc<Mutex<Vec<FailedEvent>>>,
}

impl InMemoryDeadLetterQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry regardless of status.
    #[must_use]
    pub fn entries(&self) -> Vec<FailedEvent> {
        self.entries.lock().unwrap().clone()
    }

    fn update(&self, id: i64, f: impl FnOnce(&mut FailedEvent)) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| LedgerError::DatabaseError(format!("DLQ entry {id} not found")))?;
        f(entry);
        Ok(())
    }
}

impl DeadLetterQueue for InMemoryDeadLetterQueue {
    fn add<'a>(
        &'a self,
        event: &'a SerializedEvent,
        error_message: &'a str,
        delivery_count: u32,
    ) -> LedgerFuture<'a, i64> {
        Box::pin(async move {
            let mut entries = self.entries.lock().unwrap();
            let id = i64::try_from(entries.len()).unwrap_or(i64::MAX) + 1;
            entries.push(FailedEvent {
                id,
                event: event.clone(),
                error_message: error_message.to_string(),
                delivery_count: i32::try_from(delivery_count).unwrap_or(i32::MAX),
                failed_at: Utc::now(),
                status: DLQStatus::Pending,
                resolved_at: None,
                resolved_by: None,
                resolution_notes: None,
            });
            Ok(id)
        })
    }

    fn list_pending(&self, limit: usize) -> LedgerFuture<'_, Vec<FailedEvent>> {
        Box::pin(async move {
            Ok(self
                .entries
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.status == DLQStatus::Pending)
                .take(limit)
                .cloned()
                .collect())
        })
    }

    fn mark_resolved<'a>(
        &'a self,
        id: i64,
        resolved_by: &'a str,
        notes: Option<&'a str>,
    ) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            self.update(id, |e| {
                e.status = DLQStatus::Resolved;
                e.resolved_at = Some(Utc::now());
                e.resolved_by = Some(resolved_by.to_string());
                e.resolution_notes = notes.map(str::to_string);
            })
        })
    }

    fn mark_discarded<'a>(&'a self, id: i64, reason: &'a str) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            self.update(id, |e| {
                e.status = DLQStatus::Discarded;
                e.resolved_at = Some(Utc::now());
                e.resolution_notes = Some(reason.to_string());
            })
        })
    }

    fn count_pending(&self) -> LedgerFuture<'_, i64> {
        Box::pin(async move {
            let entries = self.entries.lock().unwrap();
            let pending = entries.iter().filter(|e| e.status == DLQStatus::Pending).count();
            Ok(i64::try_from(pending).unwrap_or(i64::MAX))
        })
    }
}
