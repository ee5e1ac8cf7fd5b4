//! `PostgreSQL` implementation of the durable ledger.
//!
//! Each grab is written with `INSERT .. ON CONFLICT (event_id) DO NOTHING`;
//! the aggregate upsert only runs when that insert affected a row, inside
//! the same transaction. Likes use `processed_events` as their idempotency
//! table.

use crate::map_sqlx_error;
use chrono::{DateTime, Utc};
use flashgrab_core::event::PipelineEvent;
use flashgrab_core::ledger::{ApplyOutcome, Ledger, LedgerError, LedgerFuture};
use flashgrab_core::types::{
    DriftCorrection, GrabEvent, LikeEvent, ResourceId, StockConfig, SystemStats, UserAggregate,
    UserId,
};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgConnection, Row};
use std::time::Instant;

/// Ledger backed by a `PostgreSQL` connection pool.
///
/// # Example
///
/// ```no_run
/// use flashgrab_postgres::PostgresLedger;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let ledger = PostgresLedger::connect("postgres://localhost/flashgrab", 10).await?;
/// ledger.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool of at most `max_connections`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::ConnectionFailed`] if the database is unreachable.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| LedgerError::ConnectionFailed(e.to_string()))?;
        Ok(Self::new(pool))
    }

    /// Create or upgrade the ledger and dead-letter tables.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::DatabaseError`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), LedgerError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| LedgerError::DatabaseError(format!("Migration failed: {e}")))
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn write_events(&self, events: &[PipelineEvent]) -> Result<Vec<ApplyOutcome>, LedgerError> {
        let started = Instant::now();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            let outcome = match event {
                PipelineEvent::Grab(grab) => insert_grab(&mut tx, grab).await?,
                PipelineEvent::Like(like) => insert_like(&mut tx, like).await?,
            };
            outcomes.push(outcome);
        }

        tx.commit().await.map_err(map_sqlx_error)?;

        metrics::histogram!("ledger_write_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::debug!(
            events = events.len(),
            applied = outcomes.iter().filter(|o| **o == ApplyOutcome::Applied).count(),
            "Ledger batch committed"
        );
        Ok(outcomes)
    }
}

async fn insert_grab(conn: &mut PgConnection, event: &GrabEvent) -> Result<ApplyOutcome, LedgerError> {
    let inserted = sqlx::query(
        r"
        INSERT INTO grab_events (
            event_id, user_id, resource_id, outcome, reason, stock_snapshot, occurred_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (event_id) DO NOTHING
        ",
    )
    .bind(event.event_id.as_uuid())
    .bind(event.user_id.as_str())
    .bind(event.resource_id.as_str())
    .bind(event.outcome.as_str())
    .bind(event.outcome.reason().map(|r| r.as_str()))
    .bind(event.stock_snapshot)
    .bind(event.occurred_at)
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx_error)?
    .rows_affected();

    if inserted == 0 {
        return Ok(ApplyOutcome::AlreadyApplied);
    }

    let granted = i64::from(event.outcome.is_granted());
    sqlx::query(
        r"
        INSERT INTO user_aggregates (
            user_id, total_attempts, successful_grants, failed_attempts, last_attempt_at
        ) VALUES ($1, 1, $2, $3, $4)
        ON CONFLICT (user_id) DO UPDATE
        SET total_attempts = user_aggregates.total_attempts + 1,
            successful_grants = user_aggregates.successful_grants + EXCLUDED.successful_grants,
            failed_attempts = user_aggregates.failed_attempts + EXCLUDED.failed_attempts,
            last_attempt_at = GREATEST(user_aggregates.last_attempt_at, EXCLUDED.last_attempt_at)
        ",
    )
    .bind(event.user_id.as_str())
    .bind(granted)
    .bind(1 - granted)
    .bind(event.occurred_at)
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;

    Ok(ApplyOutcome::Applied)
}

async fn insert_like(conn: &mut PgConnection, event: &LikeEvent) -> Result<ApplyOutcome, LedgerError> {
    let inserted = sqlx::query("INSERT INTO processed_events (event_id) VALUES ($1) ON CONFLICT DO NOTHING")
        .bind(event.event_id.as_uuid())
        .execute(&mut *conn)
        .await
        .map_err(map_sqlx_error)?
        .rows_affected();

    if inserted == 0 {
        return Ok(ApplyOutcome::AlreadyApplied);
    }

    sqlx::query(
        r"
        INSERT INTO user_likes (user_id, total_likes, top_likes, last_like_at)
        VALUES ($1, 1, $2, $3)
        ON CONFLICT (user_id) DO UPDATE
        SET total_likes = user_likes.total_likes + 1,
            top_likes = user_likes.top_likes + EXCLUDED.top_likes,
            last_like_at = GREATEST(user_likes.last_like_at, EXCLUDED.last_like_at)
        ",
    )
    .bind(event.user_id.as_str())
    .bind(i64::from(event.is_top_like))
    .bind(event.occurred_at)
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;

    Ok(ApplyOutcome::Applied)
}

fn row_to_stock_config(row: &PgRow) -> StockConfig {
    StockConfig {
        resource_id: ResourceId::new(row.get::<String, _>("resource_id")),
        total: row.get("total"),
        remaining: row.get("remaining"),
        round_started_at: row.get::<Option<DateTime<Utc>>, _>("round_started_at"),
    }
}

impl Ledger for PostgresLedger {
    fn apply_grab<'a>(&'a self, event: &'a GrabEvent) -> LedgerFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
            let outcome = insert_grab(&mut tx, event).await?;
            tx.commit().await.map_err(map_sqlx_error)?;
            Ok(outcome)
        })
    }

    fn apply_like<'a>(&'a self, event: &'a LikeEvent) -> LedgerFuture<'a, ApplyOutcome> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
            let outcome = insert_like(&mut tx, event).await?;
            tx.commit().await.map_err(map_sqlx_error)?;
            Ok(outcome)
        })
    }

    fn apply_batch<'a>(
        &'a self,
        events: &'a [PipelineEvent],
    ) -> LedgerFuture<'a, Vec<ApplyOutcome>> {
        Box::pin(self.write_events(events))
    }

    fn count_granted<'a>(&'a self, resource: &'a ResourceId) -> LedgerFuture<'a, i64> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as(
                r"
                SELECT COUNT(*)
                FROM grab_events
                WHERE resource_id = $1
                  AND outcome = 'granted'
                  AND occurred_at >= COALESCE(
                      (SELECT round_started_at FROM stock_config WHERE resource_id = $1),
                      '-infinity'::timestamptz
                  )
                ",
            )
            .bind(resource.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            Ok(count)
        })
    }

    fn stock_config<'a>(
        &'a self,
        resource: &'a ResourceId,
    ) -> LedgerFuture<'a, Option<StockConfig>> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT resource_id, total, remaining, round_started_at FROM stock_config WHERE resource_id = $1",
            )
            .bind(resource.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            Ok(row.as_ref().map(row_to_stock_config))
        })
    }

    fn stock_configs(&self) -> LedgerFuture<'_, Vec<StockConfig>> {
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT resource_id, total, remaining, round_started_at FROM stock_config ORDER BY resource_id",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            Ok(rows.iter().map(row_to_stock_config).collect())
        })
    }

    fn put_stock_config<'a>(&'a self, config: &'a StockConfig) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO stock_config (resource_id, total, remaining, round_started_at, updated_at)
                VALUES ($1, $2, $3, $4, now())
                ON CONFLICT (resource_id) DO UPDATE
                SET total = EXCLUDED.total,
                    remaining = EXCLUDED.remaining,
                    round_started_at = EXCLUDED.round_started_at,
                    updated_at = now()
                ",
            )
            .bind(config.resource_id.as_str())
            .bind(config.total)
            .bind(config.remaining)
            .bind(config.round_started_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            Ok(())
        })
    }

    fn set_remaining<'a>(
        &'a self,
        resource: &'a ResourceId,
        remaining: i64,
    ) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            let updated = sqlx::query(
                "UPDATE stock_config SET remaining = $2, updated_at = now() WHERE resource_id = $1",
            )
            .bind(resource.as_str())
            .bind(remaining)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .rows_affected();

            if updated == 0 {
                return Err(LedgerError::NotConfigured(resource.to_string()));
            }
            Ok(())
        })
    }

    fn user_aggregate<'a>(
        &'a self,
        user: &'a UserId,
    ) -> LedgerFuture<'a, Option<UserAggregate>> {
        Box::pin(async move {
            let row = sqlx::query(
                r"
                SELECT total_attempts, successful_grants, failed_attempts, last_attempt_at
                FROM user_aggregates
                WHERE user_id = $1
                ",
            )
            .bind(user.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            Ok(row.map(|row| UserAggregate {
                user_id: user.clone(),
                total_attempts: row.get("total_attempts"),
                successful_grants: row.get("successful_grants"),
                failed_attempts: row.get("failed_attempts"),
                last_attempt_at: row.get("last_attempt_at"),
            }))
        })
    }

    fn system_stats(&self) -> LedgerFuture<'_, SystemStats> {
        Box::pin(async move {
            let (total_attempts, successful_grants, failed_attempts, distinct_users): (
                i64,
                i64,
                i64,
                i64,
            ) = sqlx::query_as(
                r"
                SELECT COALESCE(SUM(total_attempts), 0)::BIGINT,
                       COALESCE(SUM(successful_grants), 0)::BIGINT,
                       COALESCE(SUM(failed_attempts), 0)::BIGINT,
                       COUNT(*)::BIGINT
                FROM user_aggregates
                ",
            )
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            let (total_likes, top_likes): (i64, i64) = sqlx::query_as(
                r"
                SELECT COALESCE(SUM(total_likes), 0)::BIGINT,
                       COALESCE(SUM(top_likes), 0)::BIGINT
                FROM user_likes
                ",
            )
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

            Ok(SystemStats {
                total_attempts,
                successful_grants,
                failed_attempts,
                distinct_users,
                total_likes,
                top_likes,
            })
        })
    }

    fn record_drift<'a>(&'a self, correction: &'a DriftCorrection) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(
                r"
                INSERT INTO drift_log (resource_id, observed, authoritative, drift, corrected_at)
                VALUES ($1, $2, $3, $4, $5)
                ",
            )
            .bind(correction.resource_id.as_str())
            .bind(correction.observed)
            .bind(correction.authoritative)
            .bind(correction.drift())
            .bind(correction.corrected_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
            Ok(())
        })
    }
}
