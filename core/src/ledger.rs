//! Durable ledger contract.
//!
//! The ledger is the source of truth for what happened: the append-only grab
//! history, per-user aggregates, like totals and the configured stock of each
//! resource. It holds no business logic; the persister decides what to write
//! and the reconciler decides what the counter should be.
//!
//! # Idempotency
//!
//! Every apply method is keyed by the event's [`EventId`](crate::types::EventId).
//! Applying the same event twice must leave exactly one history row and one
//! aggregate increment, reporting [`ApplyOutcome::AlreadyApplied`] the second
//! time. The history insert and the aggregate update happen in one unit of work.

use crate::event::PipelineEvent;
use crate::types::{
    DriftCorrection, GrabEvent, LikeEvent, ResourceId, StockConfig, SystemStats, UserAggregate,
    UserId,
};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// What an apply call did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The event was new and has been recorded.
    Applied,
    /// The event id was already recorded; nothing changed.
    AlreadyApplied,
}

/// Errors that can occur during ledger operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Could not obtain a connection.
    #[error("Ledger connection failed: {0}")]
    ConnectionFailed(String),

    /// A query failed.
    #[error("Ledger database error: {0}")]
    DatabaseError(String),

    /// A row violated a schema constraint.
    #[error("Ledger constraint violation: {0}")]
    ConstraintViolation(String),

    /// A stored row could not be mapped back to a domain value.
    #[error("Corrupt ledger row: {0}")]
    CorruptRow(String),

    /// The resource has no `stock_config` row.
    #[error("Resource not configured: {0}")]
    NotConfigured(String),
}

impl LedgerError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::ConnectionFailed(_) | Self::DatabaseError(_))
    }
}

/// Boxed future returned by [`Ledger`] methods.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LedgerError>> + Send + 'a>>;

/// Relational store of grab history, aggregates and stock configuration.
pub trait Ledger: Send + Sync {
    /// Record a grab event and fold it into the user's aggregate.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the write fails. Nothing is recorded then.
    fn apply_grab<'a>(&'a self, event: &'a GrabEvent) -> LedgerFuture<'a, ApplyOutcome>;

    /// Record a like event and fold it into the user's like totals.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the write fails.
    fn apply_like<'a>(&'a self, event: &'a LikeEvent) -> LedgerFuture<'a, ApplyOutcome>;

    /// Apply several events in one unit of work.
    ///
    /// Each event keeps its own idempotency; the returned outcomes are in input
    /// order. If the call fails, none of the events are recorded.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the write fails.
    fn apply_batch<'a>(&'a self, events: &'a [PipelineEvent])
    -> LedgerFuture<'a, Vec<ApplyOutcome>>;

    /// Number of granted grab events recorded for a resource in its current
    /// round (see [`StockConfig::round_started_at`]).
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the query fails.
    fn count_granted<'a>(&'a self, resource: &'a ResourceId) -> LedgerFuture<'a, i64>;

    /// Stock configuration of one resource.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the query fails.
    fn stock_config<'a>(&'a self, resource: &'a ResourceId)
    -> LedgerFuture<'a, Option<StockConfig>>;

    /// Every configured resource.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the query fails.
    fn stock_configs(&self) -> LedgerFuture<'_, Vec<StockConfig>>;

    /// Insert or replace a stock configuration row.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the write fails.
    fn put_stock_config<'a>(&'a self, config: &'a StockConfig) -> LedgerFuture<'a, ()>;

    /// Write back the last known remaining figure of a resource.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::NotConfigured`] if the resource has no row.
    fn set_remaining<'a>(&'a self, resource: &'a ResourceId, remaining: i64)
    -> LedgerFuture<'a, ()>;

    /// Aggregate of one user, `None` if the user never attempted a grab.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the query fails.
    fn user_aggregate<'a>(&'a self, user: &'a UserId)
    -> LedgerFuture<'a, Option<UserAggregate>>;

    /// Totals across all users.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the query fails.
    fn system_stats(&self) -> LedgerFuture<'_, SystemStats>;

    /// Append a drift correction to the audit log.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the write fails.
    fn record_drift<'a>(&'a self, correction: &'a DriftCorrection) -> LedgerFuture<'a, ()>;
}
