//! Timer records for the order scheduler
//!
//! One row per order. The processed flag is persisted before any external
//! effect of a fire, so redelivered fires are no-ops. The generation
//! counter guards a fire racing a concurrent reschedule: marking processed
//! only succeeds against the generation the fire loaded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};

use crate::{Error, Result};

/// Scheduler-owned timer record
#[derive(Debug, Clone, FromRow)]
pub struct TimerRecord {
    pub order_id: i64,
    pub due_at: DateTime<Utc>,
    pub provider: String,
    pub processed: bool,
    pub failed: bool,
    pub generation: i64,
}

#[async_trait]
pub trait TimerRepository: Send + Sync {
    /// Create or replace the timer; resets processed and bumps generation
    async fn set(&self, order_id: i64, due_at: DateTime<Utc>, provider: &str) -> Result<()>;

    /// Reschedule preserving the order id; resets processed and bumps
    /// generation
    async fn update(
        &self,
        order_id: i64,
        due_at: Option<DateTime<Utc>>,
        provider: Option<&str>,
    ) -> Result<()>;

    async fn delete(&self, order_id: i64) -> Result<()>;

    async fn get(&self, order_id: i64) -> Result<Option<TimerRecord>>;

    /// Persist processed=true if the record is still at `generation` and
    /// not yet processed. Returns whether this call won the transition.
    async fn try_mark_processed(&self, order_id: i64, generation: i64) -> Result<bool>;

    /// Undo a processed mark after a failed enqueue so a retry can fire
    /// again; only applies while the generation is unchanged
    async fn revert_processed(&self, order_id: i64, generation: i64) -> Result<()>;

    /// Give up on the timer; keeps processed=true so no further enqueue is
    /// attempted
    async fn mark_failed(&self, order_id: i64) -> Result<()>;

    /// Unprocessed, unfailed timers due at or before `now`
    async fn due_timers(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<TimerRecord>>;
}

/// PostgreSQL implementation
#[derive(Clone)]
pub struct PostgresTimerRepository {
    pool: PgPool,
}

impl PostgresTimerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TimerRepository for PostgresTimerRepository {
    async fn set(&self, order_id: i64, due_at: DateTime<Utc>, provider: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO timers (order_id, due_at, provider, processed, failed, generation)
            VALUES ($1, $2, $3, FALSE, FALSE, 1)
            ON CONFLICT (order_id) DO UPDATE
            SET due_at = EXCLUDED.due_at,
                provider = EXCLUDED.provider,
                processed = FALSE,
                failed = FALSE,
                generation = timers.generation + 1
            "#,
        )
        .bind(order_id)
        .bind(due_at)
        .bind(provider)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn update(
        &self,
        order_id: i64,
        due_at: Option<DateTime<Utc>>,
        provider: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE timers
            SET due_at = COALESCE($2, due_at),
                provider = COALESCE($3, provider),
                processed = FALSE,
                failed = FALSE,
                generation = generation + 1
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .bind(due_at)
        .bind(provider)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn delete(&self, order_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM timers WHERE order_id = $1")
            .bind(order_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(())
    }

    async fn get(&self, order_id: i64) -> Result<Option<TimerRecord>> {
        let record = sqlx::query_as::<_, TimerRecord>(
            "SELECT * FROM timers WHERE order_id = $1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(record)
    }

    async fn try_mark_processed(&self, order_id: i64, generation: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE timers
            SET processed = TRUE
            WHERE order_id = $1 AND generation = $2 AND processed = FALSE
            "#,
        )
        .bind(order_id)
        .bind(generation)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn revert_processed(&self, order_id: i64, generation: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE timers
            SET processed = FALSE
            WHERE order_id = $1 AND generation = $2 AND failed = FALSE
            "#,
        )
        .bind(order_id)
        .bind(generation)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn mark_failed(&self, order_id: i64) -> Result<()> {
        sqlx::query("UPDATE timers SET failed = TRUE, processed = TRUE WHERE order_id = $1")
            .bind(order_id)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;

        Ok(())
    }

    async fn due_timers(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<TimerRecord>> {
        let records = sqlx::query_as::<_, TimerRecord>(
            r#"
            SELECT * FROM timers
            WHERE processed = FALSE AND failed = FALSE AND due_at <= $1
            ORDER BY due_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(records)
    }
}
