//! `PostgreSQL` ledger for the flashgrab pipeline.
//!
//! Provides [`PostgresLedger`], the durable source of truth for grab history,
//! user aggregates, like totals and stock configuration, and
//! [`PostgresDeadLetterQueue`] for envelopes the persister had to give up on.
//!
//! Both share one pool and one migration set:
//!
//! ```no_run
//! use flashgrab_postgres::{PostgresDeadLetterQueue, PostgresLedger};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = PostgresLedger::connect("postgres://localhost/flashgrab", 20).await?;
//! ledger.migrate().await?;
//! let dlq = PostgresDeadLetterQueue::new(ledger.pool().clone());
//! # Ok(())
//! # }
//! ```

use flashgrab_core::ledger::LedgerError;

/// Dead-letter queue over `failed_events`.
pub mod dead_letter_queue;

/// Ledger over the grab history, aggregate and stock tables.
pub mod ledger;

pub use dead_letter_queue::PostgresDeadLetterQueue;
pub use ledger::PostgresLedger;

/// Classify a sqlx failure so callers can tell retryable errors apart.
pub(crate) fn map_sqlx_error(error: sqlx::Error) -> LedgerError {
    match error {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            LedgerError::ConnectionFailed(error.to_string())
        },
        sqlx::Error::Database(ref db)
            if db.is_unique_violation() || db.is_check_violation() || db.is_foreign_key_violation() =>
        {
            LedgerError::ConstraintViolation(error.to_string())
        },
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            LedgerError::CorruptRow(error.to_string())
        },
        _ => LedgerError::DatabaseError(error.to_string()),
    }
}
