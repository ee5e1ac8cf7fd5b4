//! Dead-letter queue contract.
//!
//! Messages that cannot be decoded are parked here after a bounded number of
//! deliveries so that the persister can acknowledge them and move on. Entries
//! are kept for manual inspection and are never removed automatically.

use crate::event::SerializedEvent;
use crate::ledger::{LedgerError, LedgerFuture};
use chrono::{DateTime, Utc};
use std::fmt;

/// Status of a failed event in the dead-letter queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Waiting for an operator.
    Pending,
    /// An operator is looking at it.
    Processing,
    /// Fixed and replayed by hand.
    Resolved,
    /// Judged unrecoverable.
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::CorruptRow`] if the string is not a known status.
    pub fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(LedgerError::CorruptRow(format!("Invalid DLQ status: {s}"))),
        }
    }
}

impl fmt::Display for DLQStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An entry in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedEvent {
    /// Queue-assigned id.
    pub id: i64,
    /// The raw envelope exactly as it was delivered.
    pub event: SerializedEvent,
    /// Why it could not be processed.
    pub error_message: String,
    /// Deliveries seen before it was parked.
    pub delivery_count: i32,
    /// When it was parked.
    pub failed_at: DateTime<Utc>,
    /// Current status.
    pub status: DLQStatus,
    /// When an operator closed it.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Who closed it.
    pub resolved_by: Option<String>,
    /// Free-form notes left by the operator.
    pub resolution_notes: Option<String>,
}

/// Persistent parking lot for undecodable events.
pub trait DeadLetterQueue: Send + Sync {
    /// Park an envelope and return its queue id.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the insert fails.
    fn add<'a>(
        &'a self,
        event: &'a SerializedEvent,
        error_message: &'a str,
        delivery_count: u32,
    ) -> LedgerFuture<'a, i64>;

    /// Oldest pending entries first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the query fails.
    fn list_pending(&self, limit: usize) -> LedgerFuture<'_, Vec<FailedEvent>>;

    /// Close an entry as fixed.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the update fails.
    fn mark_resolved<'a>(
        &'a self,
        id: i64,
        resolved_by: &'a str,
        notes: Option<&'a str>,
    ) -> LedgerFuture<'a, ()>;

    /// Close an entry as unrecoverable.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the update fails.
    fn mark_discarded<'a>(&'a self, id: i64, reason: &'a str) -> LedgerFuture<'a, ()>;

    /// Number of pending entries.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the query fails.
    fn count_pending(&self) -> LedgerFuture<'_, i64>;
}
