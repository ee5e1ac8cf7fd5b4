//! Operator actions: counter bootstrap, stock reset, on-demand reconcile.

use crate::reconciler::{ReconcileError, ReconcileReport, Reconciler};
use flashgrab_core::counter_store::{CounterStore, CounterStoreError};
use flashgrab_core::environment::Clock;
use flashgrab_core::ledger::{Ledger, LedgerError};
use flashgrab_core::types::{ResourceId, StockConfig};
use std::sync::Arc;
use thiserror::Error;

/// Errors returned by [`Admin`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdminError {
    /// The resource has no `stock_config` row.
    #[error("Resource not configured: {0}")]
    NotConfigured(ResourceId),

    /// Stock totals cannot be negative.
    #[error("Invalid stock total {total} for {resource}")]
    InvalidTotal {
        /// Resource being reset.
        resource: ResourceId,
        /// Rejected total.
        total: i64,
    },

    /// Ledger failure.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Counter store failure.
    #[error("Counter store error: {0}")]
    Counter(#[from] CounterStoreError),

    /// Reconcile failure.
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

/// What bootstrap did for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seeded {
    /// The counter was missing and has been seeded with this value.
    Created(i64),
    /// A live counter already existed and was left untouched.
    Existing(i64),
}

/// Result of [`Admin::reset`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResetReport {
    /// Resource reset.
    pub resource_id: ResourceId,
    /// New total (and remaining).
    pub total: i64,
    /// Duplicate markers removed.
    pub markers_cleared: u64,
}

/// Operator entry points.
pub struct Admin {
    counter: Arc<dyn CounterStore>,
    ledger: Arc<dyn Ledger>,
    reconciler: Arc<Reconciler>,
    clock: Arc<dyn Clock>,
}

impl Admin {
    /// Create the admin surface.
    #[must_use]
    pub fn new(
        counter: Arc<dyn CounterStore>,
        ledger: Arc<dyn Ledger>,
        reconciler: Arc<Reconciler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            counter,
            ledger,
            reconciler,
            clock,
        }
    }

    /// Seed every missing counter.
    ///
    /// The seed is `stock_config.remaining` (else `total`), never more than
    /// `total - granted` as counted by the ledger for the current round, so a
    /// counter lost with the store is not refilled with units already sold.
    /// Live counters are never overwritten: drift on a live counter is the
    /// reconciler's job.
    ///
    /// # Errors
    ///
    /// Fails on the first resource without configuration or on a store error.
    pub async fn bootstrap(
        &self,
        resources: &[ResourceId],
    ) -> Result<Vec<(ResourceId, Seeded)>, AdminError> {
        let mut seeded = Vec::with_capacity(resources.len());
        for resource in resources {
            let config = self
                .ledger
                .stock_config(resource)
                .await?
                .ok_or_else(|| AdminError::NotConfigured(resource.clone()))?;
            let granted = self.ledger.count_granted(resource).await?;
            let value = config
                .seed_value()
                .min(config.total - granted)
                .clamp(0, config.total);

            let outcome = if self.counter.compare_and_set(resource, None, value).await? {
                tracing::info!(resource_id = %resource, value, "Stock counter seeded");
                Seeded::Created(value)
            } else {
                let live = self.counter.get(resource).await?.unwrap_or(value);
                tracing::info!(resource_id = %resource, live, "Stock counter already present");
                Seeded::Existing(live)
            };
            seeded.push((resource.clone(), outcome));
        }
        Ok(seeded)
    }

    /// Start a new round for `resource` with `total` units.
    ///
    /// Grab history is kept; grants before the reset stop counting against the
    /// new total.
    ///
    /// # Errors
    ///
    /// Returns [`AdminError::InvalidTotal`] for a negative total, or a store
    /// error.
    pub async fn reset(&self, resource: &ResourceId, total: i64) -> Result<ResetReport, AdminError> {
        if total < 0 {
            return Err(AdminError::InvalidTotal {
                resource: resource.clone(),
                total,
            });
        }

        self.ledger
            .put_stock_config(&StockConfig {
                resource_id: resource.clone(),
                total,
                remaining: Some(total),
                round_started_at: Some(self.clock.now()),
            })
            .await?;
        self.counter.set(resource, total).await?;
        let markers_cleared = self.counter.clear_markers(resource).await?;

        tracing::info!(resource_id = %resource, total, markers_cleared, "Stock reset");
        Ok(ResetReport {
            resource_id: resource.clone(),
            total,
            markers_cleared,
        })
    }

    /// Run one reconcile pass now.
    ///
    /// # Errors
    ///
    /// See [`Reconciler::reconcile`].
    pub async fn reconcile(&self, resource: &ResourceId) -> Result<ReconcileReport, AdminError> {
        Ok(self.reconciler.reconcile(resource).await?)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::reconciler::ReconcilerConfig;
    use flashgrab_core::counter_store::Decrement;
    use flashgrab_core::types::{EventId, GrabEvent, Outcome, UserId};
    use flashgrab_testing::{FixedClock, InMemoryCounterStore, InMemoryLedger, test_clock};

    fn admin(counter: &InMemoryCounterStore, ledger: &InMemoryLedger, clock: &FixedClock) -> Admin {
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(counter.clone()),
            Arc::new(ledger.clone()),
            Arc::new(clock.clone()),
            ReconcilerConfig::default(),
        ));
        Admin::new(
            Arc::new(counter.clone()),
            Arc::new(ledger.clone()),
            reconciler,
            Arc::new(clock.clone()),
        )
    }

    #[tokio::test]
    async fn bootstrap_seeds_from_remaining_then_total() {
        let counter = InMemoryCounterStore::new();
        let ledger = InMemoryLedger::with_stock(&[("a", 10)]);
        ledger.insert_stock(StockConfig {
            remaining: Some(4),
            ..StockConfig::new(ResourceId::new("b"), 10)
        });

        let seeded = admin(&counter, &ledger, &test_clock())
            .bootstrap(&[ResourceId::new("a"), ResourceId::new("b")])
            .await
            .unwrap();

        assert_eq!(seeded[0].1, Seeded::Created(10));
        assert_eq!(seeded[1].1, Seeded::Created(4));
        assert_eq!(counter.value(&ResourceId::new("b")), Some(4));
    }

    #[tokio::test]
    async fn bootstrap_after_counter_loss_does_not_resell_granted_units() {
        let counter = InMemoryCounterStore::new();
        let ledger = InMemoryLedger::with_stock(&[("coupon", 3)]);
        let clock = test_clock();
        let resource = ResourceId::new("coupon");
        let admin = admin(&counter, &ledger, &clock);
        admin.bootstrap(std::slice::from_ref(&resource)).await.unwrap();

        for user in ["u1", "u2", "u3"] {
            ledger
                .apply_grab(&GrabEvent {
                    event_id: EventId::new(),
                    user_id: UserId::new(user),
                    resource_id: resource.clone(),
                    outcome: Outcome::Granted,
                    stock_snapshot: 0,
                    occurred_at: clock.now(),
                })
                .await
                .unwrap();
        }
        counter.seed(&resource, 0);
        assert!(!admin.reconcile(&resource).await.unwrap().corrected);
        assert_eq!(ledger.stock_row(&resource).unwrap().remaining, None);

        counter.forget(&resource);
        let seeded = admin.bootstrap(std::slice::from_ref(&resource)).await.unwrap();
        assert_eq!(seeded[0].1, Seeded::Created(0));
        assert_eq!(counter.bounded_decrement(&resource).await.unwrap(), Decrement::Refused);
    }

    #[tokio::test]
    async fn bootstrap_keeps_live_counter() {
        let counter = InMemoryCounterStore::new();
        let ledger = InMemoryLedger::with_stock(&[("a", 10)]);
        counter.seed(&ResourceId::new("a"), 2);

        let seeded = admin(&counter, &ledger, &test_clock())
            .bootstrap(&[ResourceId::new("a")])
            .await
            .unwrap();
        assert_eq!(seeded[0].1, Seeded::Existing(2));
        assert_eq!(counter.value(&ResourceId::new("a")), Some(2));
    }

    #[tokio::test]
    async fn bootstrap_rejects_unconfigured_resource() {
        let counter = InMemoryCounterStore::new();
        let ledger = InMemoryLedger::new();
        let result = admin(&counter, &ledger, &test_clock())
            .bootstrap(&[ResourceId::new("ghost")])
            .await;
        assert_eq!(result, Err(AdminError::NotConfigured(ResourceId::new("ghost"))));
    }

    #[tokio::test]
    async fn reset_restores_stock_and_clears_markers() {
        let counter = InMemoryCounterStore::new();
        let ledger = InMemoryLedger::with_stock(&[("a", 3)]);
        let resource = ResourceId::new("a");
        counter.seed(&resource, 0);
        let token = EventId::new();
        counter.mark_once(&resource, &UserId::new("u1"), &token).await.unwrap();
        counter.mark_once(&resource, &UserId::new("u2"), &token).await.unwrap();

        let report = admin(&counter, &ledger, &test_clock())
            .reset(&resource, 5)
            .await
            .unwrap();

        assert_eq!(report.markers_cleared, 2);
        assert_eq!(counter.value(&resource), Some(5));
        let row = ledger.stock_row(&resource).unwrap();
        assert_eq!((row.total, row.remaining), (5, Some(5)));
        assert!(!counter.has_marker(&resource, &UserId::new("u1")));
    }

    #[tokio::test]
    async fn grants_before_reset_do_not_cause_drift() {
        let counter = InMemoryCounterStore::new();
        let ledger = InMemoryLedger::with_stock(&[("a", 3)]);
        let clock = test_clock();
        let resource = ResourceId::new("a");
        ledger
            .apply_grab(&GrabEvent {
                event_id: EventId::new(),
                user_id: UserId::new("u1"),
                resource_id: resource.clone(),
                outcome: Outcome::Granted,
                stock_snapshot: 2,
                occurred_at: clock.now() - chrono::Duration::minutes(1),
            })
            .await
            .unwrap();

        let admin = admin(&counter, &ledger, &clock);
        admin.reset(&resource, 3).await.unwrap();
        let report = admin.reconcile(&resource).await.unwrap();
        assert_eq!(report.drift, 0);
        assert!(!report.corrected);
    }

    #[tokio::test]
    async fn negative_total_is_rejected() {
        let counter = InMemoryCounterStore::new();
        let ledger = InMemoryLedger::new();
        let result = admin(&counter, &ledger, &test_clock())
            .reset(&ResourceId::new("a"), -1)
            .await;
        assert!(matches!(result, Err(AdminError::InvalidTotal { total: -1, .. })));
    }
}
