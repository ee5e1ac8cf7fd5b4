//! Dead Letter Queue (DLQ) for undecodable envelopes.
//!
//! The persister parks a delivery here once it has failed to decode on
//! `max_deliveries` attempts, then acknowledges it. Rows stay until an
//! operator resolves or discards them.

use crate::map_sqlx_error;
use chrono::{DateTime, Utc};
use flashgrab_core::dead_letter::{DLQStatus, DeadLetterQueue, FailedEvent};
use flashgrab_core::event::SerializedEvent;
use flashgrab_core::ledger::{LedgerError, LedgerFuture};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// `PostgreSQL`-backed [`DeadLetterQueue`] over the `failed_events` table.
///
/// # Example
///
/// ```no_run
/// use flashgrab_core::dead_letter::DeadLetterQueue;
/// use flashgrab_postgres::PostgresDeadLetterQueue;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = PostgresDeadLetterQueue::new(pool);
///
/// for entry in dlq.list_pending(100).await? {
///     dlq.mark_discarded(entry.id, "schema retired").await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresDeadLetterQueue {
    pool: PgPool,
}

impl PostgresDeadLetterQueue {
    /// Create a queue on the given pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Entries in the given status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the query fails or a row is corrupt.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedEvent>, LedgerError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r"
            SELECT
                id, event_type, event_key, event_data, error_message, delivery_count,
                failed_at, status, resolved_at, resolved_by, resolution_notes
            FROM failed_events
            WHERE status = $1
            ORDER BY failed_at ASC, id ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(row_to_failed_event).collect()
    }

    /// Move an entry to `status`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::DatabaseError`] if the entry does not exist.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), LedgerError> {
        let updated = sqlx::query("UPDATE failed_events SET status = $1 WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();
        ensure_found(id, updated)?;

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");
        Ok(())
    }
}

fn ensure_found(id: i64, rows_affected: u64) -> Result<(), LedgerError> {
    if rows_affected == 0 {
        return Err(LedgerError::DatabaseError(format!("DLQ entry {id} not found")));
    }
    Ok(())
}

fn row_to_failed_event(row: &PgRow) -> Result<FailedEvent, LedgerError> {
    let status: String = row.get("status");
    Ok(FailedEvent {
        id: row.get("id"),
        event: SerializedEvent::new(row.get("event_type"), row.get("event_key"), row.get("event_data")),
        error_message: row.get("error_message"),
        delivery_count: row.get("delivery_count"),
        failed_at: row.get::<DateTime<Utc>, _>("failed_at"),
        status: DLQStatus::parse(&status)?,
        resolved_at: row.get("resolved_at"),
        resolved_by: row.get("resolved_by"),
        resolution_notes: row.get("resolution_notes"),
    })
}

impl DeadLetterQueue for PostgresDeadLetterQueue {
    fn add<'a>(
        &'a self,
        event: &'a SerializedEvent,
        error_message: &'a str,
        delivery_count: u32,
    ) -> LedgerFuture<'a, i64> {
        Box::pin(async move {
            let deliveries = i32::try_from(delivery_count).unwrap_or(i32::MAX);
            let (id,): (i64,) = sqlx::query_as(
                r"
                INSERT INTO failed_events (
                    event_type, event_key, event_data, error_message, delivery_count
                ) VALUES ($1, $2, $3, $4, $5)
                RETURNING id
                ",
            )
            .bind(&event.event_type)
            .bind(&event.key)
            .bind(&event.data)
            .bind(error_message)
            .bind(deliveries)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            tracing::warn!(
                dlq_id = id,
                event_type = %event.event_type,
                key = %event.key,
                error = error_message,
                delivery_count,
                "Event added to Dead Letter Queue"
            );
            metrics::counter!("persister_dlq_added_total", "event_type" => event.event_type.clone())
                .increment(1);

            Ok(id)
        })
    }

    fn list_pending(&self, limit: usize) -> LedgerFuture<'_, Vec<FailedEvent>> {
        Box::pin(self.list_by_status(DLQStatus::Pending, limit))
    }

    fn mark_resolved<'a>(
        &'a self,
        id: i64,
        resolved_by: &'a str,
        notes: Option<&'a str>,
    ) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            let updated = sqlx::query(
                r"
                UPDATE failed_events
                SET status = 'resolved',
                    resolved_at = NOW(),
                    resolved_by = $1,
                    resolution_notes = $2
                WHERE id = $3
                ",
            )
            .bind(resolved_by)
            .bind(notes)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();
            ensure_found(id, updated)?;

            tracing::info!(dlq_id = id, resolved_by, "DLQ entry marked as resolved");
            metrics::counter!("persister_dlq_resolved_total").increment(1);
            Ok(())
        })
    }

    fn mark_discarded<'a>(&'a self, id: i64, reason: &'a str) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            let updated = sqlx::query(
                r"
                UPDATE failed_events
                SET status = 'discarded',
                    resolved_at = NOW(),
                    resolution_notes = $1
                WHERE id = $2
                ",
            )
            .bind(reason)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();
            ensure_found(id, updated)?;

            tracing::warn!(dlq_id = id, reason, "DLQ entry marked as discarded");
            metrics::counter!("persister_dlq_discarded_total").increment(1);
            Ok(())
        })
    }

    fn count_pending(&self) -> LedgerFuture<'_, i64> {
        Box::pin(async move {
            let (count,): (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM failed_events WHERE status = 'pending'")
                    .fetch_one(&self.pool)
                    .await
                    .map_err(map_sqlx_error)?;
            Ok(count)
        })
    }
}
