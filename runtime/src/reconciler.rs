//! Drift detection and correction between the counter store and the ledger.
//!
//! The ledger is authoritative: `remaining = total - count(granted events)`.
//! When the live counter differs by more than the tolerance it is overwritten
//! with the ledger figure, the figure is written back to `stock_config`, and
//! the correction is appended to the drift log.
//!
//! Corrections use compare-and-set against the value that was observed, so a
//! grab that lands between the read and the write makes the pass a no-op
//! instead of being clobbered.
//!
//! # Upward corrections
//!
//! Granted events still travelling through the channel are not yet counted
//! by the ledger, which makes the ledger figure temporarily *higher* than
//! the truth. Lowering a counter is always safe; raising one is not. With
//! [`ReconcilerConfig::confirm_upward`] set (the default), an upward
//! correction is only applied after two consecutive passes observe the same
//! counter value and the same ledger figure, i.e. once the pipeline has
//! settled. A missing counter is always re-seeded.

use crate::metrics::ReconcilerMetrics;
use flashgrab_core::counter_store::{CounterStore, CounterStoreError};
use flashgrab_core::environment::Clock;
use flashgrab_core::ledger::{Ledger, LedgerError};
use flashgrab_core::types::{DriftCorrection, ResourceId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Errors returned by [`Reconciler::reconcile`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Another pass for the same resource is running.
    #[error("Reconcile already in progress for {0}")]
    InProgress(ResourceId),

    /// The resource has no `stock_config` row.
    #[error("Resource not configured: {0}")]
    NotConfigured(ResourceId),

    /// Ledger read or write failed.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Counter store read or write failed.
    #[error("Counter store error: {0}")]
    Counter(#[from] CounterStoreError),
}

/// Result of one reconcile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Resource checked.
    pub resource_id: ResourceId,
    /// Live counter before the pass (`None` if the key was missing).
    pub observed: Option<i64>,
    /// Ledger-derived remaining stock.
    pub authoritative: i64,
    /// `observed - authoritative`; a missing counter counts as zero.
    pub drift: i64,
    /// Whether the counter was overwritten.
    pub corrected: bool,
    /// An upward correction is waiting for a confirming pass.
    pub awaiting_confirmation: bool,
}

/// Reconciler settings.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    /// Largest `|drift|` left uncorrected.
    pub tolerance: i64,
    /// Require two identical passes before raising a counter.
    pub confirm_upward: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tolerance: 0,
            confirm_upward: true,
        }
    }
}

type Observation = (Option<i64>, i64);

/// Single-flight reconciler.
pub struct Reconciler {
    counter: Arc<dyn CounterStore>,
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    config: ReconcilerConfig,
    running: Mutex<HashSet<ResourceId>>,
    upward: Mutex<HashMap<ResourceId, Observation>>,
}

struct InFlight<'a> {
    running: &'a Mutex<HashSet<ResourceId>>,
    resource: ResourceId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.running).remove(&self.resource);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Reconciler {
    /// Create a reconciler.
    #[must_use]
    pub fn new(
        counter: Arc<dyn CounterStore>,
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            counter,
            ledger,
            clock,
            config,
            running: Mutex::new(HashSet::new()),
            upward: Mutex::new(HashMap::new()),
        }
    }

    fn begin(&self, resource: &ResourceId) -> Result<InFlight<'_>, ReconcileError> {
        if !lock(&self.running).insert(resource.clone()) {
            return Err(ReconcileError::InProgress(resource.clone()));
        }
        Ok(InFlight {
            running: &self.running,
            resource: resource.clone(),
        })
    }

    /// Compare the live counter with the ledger and correct drift.
    ///
    /// # Errors
    ///
    /// - [`ReconcileError::InProgress`] if a pass for `resource` is running
    /// - [`ReconcileError::NotConfigured`] if the resource has no stock row
    /// - store errors; if the ledger write-back fails after the counter was
    ///   corrected, the counter stays corrected and the error is returned
    pub async fn reconcile(&self, resource: &ResourceId) -> Result<ReconcileReport, ReconcileError> {
        let _guard = self.begin(resource)?;

        let config = self
            .ledger
            .stock_config(resource)
            .await?
            .ok_or_else(|| ReconcileError::NotConfigured(resource.clone()))?;
        let granted = self.ledger.count_granted(resource).await?;
        let authoritative = (config.total - granted).clamp(0, config.total);
        let observed = self.counter.get(resource).await?;

        let drift = observed.unwrap_or(0) - authoritative;
        let mut report = ReconcileReport {
            resource_id: resource.clone(),
            observed,
            authoritative,
            drift,
            corrected: false,
            awaiting_confirmation: false,
        };

        let needs_correction = observed.is_none() || drift.abs() > self.config.tolerance;
        if !needs_correction {
            lock(&self.upward).remove(resource);
            tracing::debug!(resource_id = %resource, authoritative, "Counter in sync");
            ReconcilerMetrics::record_run(resource.as_str(), drift, false);
            return Ok(report);
        }

        if observed.is_some() && drift < 0 && self.config.confirm_upward {
            let previous = lock(&self.upward).insert(resource.clone(), (observed, authoritative));
            if previous != Some((observed, authoritative)) {
                tracing::info!(
                    resource_id = %resource,
                    observed = ?observed,
                    authoritative,
                    "Counter below ledger figure, waiting for a confirming pass"
                );
                report.awaiting_confirmation = true;
                ReconcilerMetrics::record_run(resource.as_str(), drift, false);
                return Ok(report);
            }
        }
        lock(&self.upward).remove(resource);

        if !self
            .counter
            .compare_and_set(resource, observed, authoritative)
            .await?
        {
            tracing::info!(
                resource_id = %resource,
                observed = ?observed,
                "Counter moved during reconcile, skipping correction"
            );
            ReconcilerMetrics::record_run(resource.as_str(), drift, false);
            return Ok(report);
        }

        report.corrected = true;
        tracing::warn!(
            resource_id = %resource,
            observed = ?observed,
            authoritative,
            drift,
            "Stock counter drift corrected"
        );
        ReconcilerMetrics::record_run(resource.as_str(), drift, true);

        self.ledger.set_remaining(resource, authoritative).await?;
        self.ledger
            .record_drift(&DriftCorrection {
                resource_id: resource.clone(),
                observed,
                authoritative,
                corrected_at: self.clock.now(),
            })
            .await?;

        Ok(report)
    }

    /// Run [`Self::reconcile`] for every resource each `interval` until
    /// `shutdown` fires. Errors are logged and the loop continues.
    #[must_use]
    pub fn spawn_periodic(
        self: Arc<Self>,
        resources: Vec<ResourceId>,
        interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(resources = resources.len(), ?interval, "Reconciler started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {}
                }

                for resource in &resources {
                    match self.reconcile(resource).await {
                        Ok(_) => {}
                        Err(ReconcileError::InProgress(_)) => {
                            tracing::debug!(resource_id = %resource, "Reconcile skipped, already running");
                        }
                        Err(error) => {
                            tracing::error!(resource_id = %resource, %error, "Reconcile failed");
                        }
                    }
                }
            }

            tracing::info!("Reconciler stopped");
        })
    }
}
