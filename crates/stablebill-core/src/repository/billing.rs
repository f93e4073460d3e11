//! Subscription & order store
//!
//! Durable state for subscriptions, orders, and their transitions. Every
//! operation here is atomic: multi-row mutations run inside one transaction
//! and the claim operations are single UPDATE … RETURNING statements so two
//! concurrent claimers can never obtain the same order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{DueOrder, NewOrder, OrderDetails, OrderStatus, Subscription, SubscriptionStatus};
use crate::{Error, Result};

/// Parameters for a new subscription row
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub subscription_id: String,
    pub account_id: Uuid,
    pub beneficiary_address: String,
    pub provider: String,
    pub testnet: bool,
}

/// Outcome of `create_subscription_with_order`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created { order_id: i64, order_number: i32 },
    /// Subscription id already registered; nothing written
    Duplicate,
}

/// Store contract consumed by the activation orchestrator, the payment
/// processor, and the scheduler.
#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Insert a subscription (status=Processing) and its first order
    /// (type=Initial, status=Processing) atomically.
    async fn create_subscription_with_order(
        &self,
        subscription: &NewSubscription,
        initial: &NewOrder,
    ) -> Result<CreateOutcome>;

    async fn subscription_exists(&self, subscription_id: &str) -> Result<bool>;

    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<Subscription>>;

    /// Order joined with its subscription
    async fn get_order_details(&self, order_id: i64) -> Result<Option<OrderDetails>>;

    /// One batch: mark the activation order Paid with its transaction,
    /// insert the next Recurring order (Pending), mark the subscription
    /// Active. Returns the new order's id.
    async fn execute_subscription_activation(
        &self,
        subscription_id: &str,
        order_id: i64,
        transaction_hash: &str,
        next_due_at: DateTime<Utc>,
        next_amount: Decimal,
        period_seconds: i64,
    ) -> Result<i64>;

    /// Activation-charge failure: subscription → Incomplete, order →
    /// Failed(reason)
    async fn mark_subscription_incomplete(
        &self,
        subscription_id: &str,
        order_id: i64,
        reason: &str,
        raw_error: &str,
    ) -> Result<()>;

    /// Recurring-charge success: mark the order Paid, optionally insert the
    /// next Pending order, mark the subscription Active. Returns the next
    /// order's id when one was created.
    async fn execute_recurring_success(
        &self,
        subscription_id: &str,
        order_id: i64,
        transaction_hash: &str,
        next: Option<(DateTime<Utc>, Decimal, i64)>,
    ) -> Result<Option<i64>>;

    /// Update a single order; returns its order number
    async fn update_order(
        &self,
        order_id: i64,
        status: OrderStatus,
        failure_reason: Option<&str>,
        raw_error: Option<&str>,
        transaction_hash: Option<&str>,
    ) -> Result<i32>;

    /// Idempotent Pending/Failed → Processing transition; false when the
    /// order was already Processing
    async fn mark_order_processing(&self, order_id: i64) -> Result<bool>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        status: SubscriptionStatus,
    ) -> Result<()>;

    /// One batch: increment attempts, set next-retry-at, order → Failed,
    /// subscription → PastDue
    async fn schedule_retry(
        &self,
        order_id: i64,
        subscription_id: &str,
        next_retry_at: DateTime<Utc>,
        reason: Option<&str>,
        raw_error: Option<&str>,
    ) -> Result<()>;

    /// One batch for the final failed attempt: record it, clear the retry
    /// deadline, order → Failed, subscription → Unpaid
    async fn exhaust_retries(
        &self,
        order_id: i64,
        subscription_id: &str,
        reason: &str,
        raw_error: &str,
    ) -> Result<()>;

    /// One batch: clear next-retry-at, subscription → Active
    async fn reactivate_subscription(&self, order_id: i64, subscription_id: &str) -> Result<()>;

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<()>;

    /// Mark every Pending order of the subscription Failed("canceled");
    /// returns their ids so the scheduler can drop their timers
    async fn cancel_pending_orders(&self, subscription_id: &str) -> Result<Vec<i64>>;

    /// Atomically claim up to `limit` due Pending orders on Active
    /// subscriptions, transitioning them to Processing. The only legitimate
    /// way to take a scheduled order off the ready set.
    async fn claim_due_orders(&self, limit: i64) -> Result<Vec<DueOrder>>;

    /// Same shape for dunning: claim Failed orders on PastDue subscriptions
    /// whose next-retry-at has passed
    async fn get_due_retries(&self, limit: i64) -> Result<Vec<DueOrder>>;

    /// Insert a standalone Pending Recurring order; used when an
    /// unclassified payment failure leaves the subscription Active but the
    /// cadence must continue
    async fn create_recurring_order(
        &self,
        subscription_id: &str,
        due_at: DateTime<Utc>,
        amount: Decimal,
        period_seconds: i64,
    ) -> Result<i64>;

    /// Transaction hash of the order if it already charged successfully;
    /// the processor's idempotency check
    async fn find_paid_transaction(&self, order_id: i64) -> Result<Option<String>>;
}

/// PostgreSQL implementation of the billing store
#[derive(Clone)]
pub struct PostgresBillingStore {
    pool: PgPool,
}

impl PostgresBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert an order allocating the next per-subscription order number
    /// inside the statement, so numbering stays gap-free under concurrency.
    async fn insert_order<'e, E>(
        executor: E,
        subscription_id: &str,
        order: &NewOrder,
    ) -> Result<(i64, i32)>
    where
        E: sqlx::Executor<'e, Database = sqlx::Postgres>,
    {
        let row: (i64, i32) = sqlx::query_as(
            r#"
            INSERT INTO orders (
                subscription_id, order_number, order_type, due_at, amount,
                period_length_seconds, status, attempts
            )
            VALUES (
                $1,
                (SELECT COALESCE(MAX(order_number), 0) + 1 FROM orders WHERE subscription_id = $1),
                $2, $3, $4, $5, $6, 0
            )
            RETURNING id, order_number
            "#,
        )
        .bind(subscription_id)
        .bind(order.r#type)
        .bind(order.due_at)
        .bind(order.amount)
        .bind(order.period_length_seconds)
        .bind(order.status)
        .fetch_one(executor)
        .await
        .map_err(Error::Database)?;

        Ok(row)
    }
}

#[async_trait]
impl BillingStore for PostgresBillingStore {
    async fn create_subscription_with_order(
        &self,
        subscription: &NewSubscription,
        initial: &NewOrder,
    ) -> Result<CreateOutcome> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO subscriptions (
                subscription_id, account_id, beneficiary_address, provider,
                testnet, status, created_at, modified_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
            ON CONFLICT (subscription_id) DO NOTHING
            "#,
        )
        .bind(&subscription.subscription_id)
        .bind(subscription.account_id)
        .bind(&subscription.beneficiary_address)
        .bind(&subscription.provider)
        .bind(subscription.testnet)
        .bind(SubscriptionStatus::Processing)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        if inserted.rows_affected() == 0 {
            tx.rollback().await.map_err(Error::Database)?;
            return Ok(CreateOutcome::Duplicate);
        }

        let (order_id, order_number) =
            Self::insert_order(&mut *tx, &subscription.subscription_id, initial).await?;

        tx.commit().await.map_err(Error::Database)?;

        Ok(CreateOutcome::Created {
            order_id,
            order_number,
        })
    }

    async fn subscription_exists(&self, subscription_id: &str) -> Result<bool> {
        let exists: (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM subscriptions WHERE subscription_id = $1)",
        )
        .bind(subscription_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(exists.0)
    }

    async fn get_subscription(&self, subscription_id: &str) -> Result<Option<Subscription>> {
        let subscription = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE subscription_id = $1",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(subscription)
    }

    async fn get_order_details(&self, order_id: i64) -> Result<Option<OrderDetails>> {
        let details = sqlx::query_as::<_, OrderDetails>(
            r#"
            SELECT
                o.id AS order_id, o.subscription_id, o.order_number, o.order_type,
                o.due_at, o.amount, o.period_length_seconds, o.status, o.attempts,
                o.next_retry_at, o.transaction_hash,
                s.status AS subscription_status, s.account_id,
                s.beneficiary_address, s.provider, s.testnet
            FROM orders o
            JOIN subscriptions s ON s.subscription_id = o.subscription_id
            WHERE o.id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(details)
    }

    async fn execute_subscription_activation(
        &self,
        subscription_id: &str,
        order_id: i64,
        transaction_hash: &str,
        next_due_at: DateTime<Utc>,
        next_amount: Decimal,
        period_seconds: i64,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query(
            "UPDATE orders SET status = $1, transaction_hash = $2 WHERE id = $3",
        )
        .bind(OrderStatus::Paid)
        .bind(transaction_hash)
        .bind(order_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let next = NewOrder {
            r#type: crate::models::OrderType::Recurring,
            due_at: next_due_at,
            amount: next_amount,
            period_length_seconds: period_seconds,
            status: OrderStatus::Pending,
        };
        let (next_order_id, _) = Self::insert_order(&mut *tx, subscription_id, &next).await?;

        sqlx::query(
            "UPDATE subscriptions SET status = $1, modified_at = NOW() WHERE subscription_id = $2",
        )
        .bind(SubscriptionStatus::Active)
        .bind(subscription_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        Ok(next_order_id)
    }

    async fn mark_subscription_incomplete(
        &self,
        subscription_id: &str,
        order_id: i64,
        reason: &str,
        raw_error: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query(
            "UPDATE orders SET status = $1, failure_reason = $2, raw_error = $3 WHERE id = $4",
        )
        .bind(OrderStatus::Failed)
        .bind(reason)
        .bind(raw_error)
        .bind(order_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        sqlx::query(
            "UPDATE subscriptions SET status = $1, modified_at = NOW() WHERE subscription_id = $2",
        )
        .bind(SubscriptionStatus::Incomplete)
        .bind(subscription_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        Ok(())
    }

    async fn execute_recurring_success(
        &self,
        subscription_id: &str,
        order_id: i64,
        transaction_hash: &str,
        next: Option<(DateTime<Utc>, Decimal, i64)>,
    ) -> Result<Option<i64>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query(
            r#"
            UPDATE orders
            SET status = $1, transaction_hash = $2, next_retry_at = NULL,
                failure_reason = NULL, raw_error = NULL
            WHERE id = $3
            "#,
        )
        .bind(OrderStatus::Paid)
        .bind(transaction_hash)
        .bind(order_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let next_order_id = match next {
            Some((due_at, amount, period_seconds)) => {
                let order = NewOrder {
                    r#type: crate::models::OrderType::Recurring,
                    due_at,
                    amount,
                    period_length_seconds: period_seconds,
                    status: OrderStatus::Pending,
                };
                let (id, _) = Self::insert_order(&mut *tx, subscription_id, &order).await?;
                Some(id)
            }
            None => None,
        };

        sqlx::query(
            "UPDATE subscriptions SET status = $1, modified_at = NOW() WHERE subscription_id = $2",
        )
        .bind(SubscriptionStatus::Active)
        .bind(subscription_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        Ok(next_order_id)
    }

    async fn update_order(
        &self,
        order_id: i64,
        status: OrderStatus,
        failure_reason: Option<&str>,
        raw_error: Option<&str>,
        transaction_hash: Option<&str>,
    ) -> Result<i32> {
        let row: (i32,) = sqlx::query_as(
            r#"
            UPDATE orders
            SET status = $1,
                failure_reason = COALESCE($2, failure_reason),
                raw_error = COALESCE($3, raw_error),
                transaction_hash = COALESCE($4, transaction_hash)
            WHERE id = $5
            RETURNING order_number
            "#,
        )
        .bind(status)
        .bind(failure_reason)
        .bind(raw_error)
        .bind(transaction_hash)
        .bind(order_id)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.0)
    }

    async fn mark_order_processing(&self, order_id: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE orders SET status = $1 WHERE id = $2 AND status IN ($3, $4)",
        )
        .bind(OrderStatus::Processing)
        .bind(order_id)
        .bind(OrderStatus::Pending)
        .bind(OrderStatus::Failed)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        status: SubscriptionStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE subscriptions SET status = $1, modified_at = NOW() WHERE subscription_id = $2",
        )
        .bind(status)
        .bind(subscription_id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }

    async fn schedule_retry(
        &self,
        order_id: i64,
        subscription_id: &str,
        next_retry_at: DateTime<Utc>,
        reason: Option<&str>,
        raw_error: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query(
            r#"
            UPDATE orders
            SET status = $1, attempts = attempts + 1, next_retry_at = $2,
                failure_reason = COALESCE($3, failure_reason),
                raw_error = COALESCE($4, raw_error)
            WHERE id = $5
            "#,
        )
        .bind(OrderStatus::Failed)
        .bind(next_retry_at)
        .bind(reason)
        .bind(raw_error)
        .bind(order_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        sqlx::query(
            "UPDATE subscriptions SET status = $1, modified_at = NOW() WHERE subscription_id = $2",
        )
        .bind(SubscriptionStatus::PastDue)
        .bind(subscription_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        Ok(())
    }

    async fn exhaust_retries(
        &self,
        order_id: i64,
        subscription_id: &str,
        reason: &str,
        raw_error: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query(
            r#"
            UPDATE orders
            SET status = $1, attempts = attempts + 1, next_retry_at = NULL,
                failure_reason = $2, raw_error = $3
            WHERE id = $4
            "#,
        )
        .bind(OrderStatus::Failed)
        .bind(reason)
        .bind(raw_error)
        .bind(order_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        sqlx::query(
            "UPDATE subscriptions SET status = $1, modified_at = NOW() WHERE subscription_id = $2",
        )
        .bind(SubscriptionStatus::Unpaid)
        .bind(subscription_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        Ok(())
    }

    async fn reactivate_subscription(&self, order_id: i64, subscription_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        sqlx::query("UPDATE orders SET next_retry_at = NULL WHERE id = $1")
            .bind(order_id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        sqlx::query(
            "UPDATE subscriptions SET status = $1, modified_at = NOW() WHERE subscription_id = $2",
        )
        .bind(SubscriptionStatus::Active)
        .bind(subscription_id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        tx.commit().await.map_err(Error::Database)?;

        Ok(())
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<()> {
        self.update_subscription(subscription_id, SubscriptionStatus::Canceled)
            .await
    }

    async fn cancel_pending_orders(&self, subscription_id: &str) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            UPDATE orders
            SET status = $1, failure_reason = 'canceled'
            WHERE subscription_id = $2 AND status = $3
            RETURNING id
            "#,
        )
        .bind(OrderStatus::Failed)
        .bind(subscription_id)
        .bind(OrderStatus::Pending)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn claim_due_orders(&self, limit: i64) -> Result<Vec<DueOrder>> {
        let due = sqlx::query_as::<_, DueOrder>(
            r#"
            UPDATE orders o
            SET status = $1
            FROM subscriptions s
            WHERE s.subscription_id = o.subscription_id
              AND o.id IN (
                  SELECT o2.id
                  FROM orders o2
                  JOIN subscriptions s2 ON s2.subscription_id = o2.subscription_id
                  WHERE o2.status = $2
                    AND o2.due_at <= NOW()
                    AND s2.status = $3
                  ORDER BY o2.due_at
                  LIMIT $4
                  FOR UPDATE OF o2 SKIP LOCKED
              )
            RETURNING o.id AS order_id, o.subscription_id, s.provider,
                      o.amount, o.attempts, s.testnet
            "#,
        )
        .bind(OrderStatus::Processing)
        .bind(OrderStatus::Pending)
        .bind(SubscriptionStatus::Active)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(due)
    }

    async fn get_due_retries(&self, limit: i64) -> Result<Vec<DueOrder>> {
        let due = sqlx::query_as::<_, DueOrder>(
            r#"
            UPDATE orders o
            SET status = $1
            FROM subscriptions s
            WHERE s.subscription_id = o.subscription_id
              AND o.id IN (
                  SELECT o2.id
                  FROM orders o2
                  JOIN subscriptions s2 ON s2.subscription_id = o2.subscription_id
                  WHERE o2.status = $2
                    AND o2.next_retry_at IS NOT NULL
                    AND o2.next_retry_at <= NOW()
                    AND s2.status = $3
                  ORDER BY o2.next_retry_at
                  LIMIT $4
                  FOR UPDATE OF o2 SKIP LOCKED
              )
            RETURNING o.id AS order_id, o.subscription_id, s.provider,
                      o.amount, o.attempts, s.testnet
            "#,
        )
        .bind(OrderStatus::Processing)
        .bind(OrderStatus::Failed)
        .bind(SubscriptionStatus::PastDue)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(due)
    }

    async fn create_recurring_order(
        &self,
        subscription_id: &str,
        due_at: DateTime<Utc>,
        amount: Decimal,
        period_seconds: i64,
    ) -> Result<i64> {
        let order = NewOrder {
            r#type: crate::models::OrderType::Recurring,
            due_at,
            amount,
            period_length_seconds: period_seconds,
            status: OrderStatus::Pending,
        };
        let (id, _) = Self::insert_order(&self.pool, subscription_id, &order).await?;
        Ok(id)
    }

    async fn find_paid_transaction(&self, order_id: i64) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT transaction_hash FROM orders WHERE id = $1 AND status = $2",
        )
        .bind(order_id)
        .bind(OrderStatus::Paid)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.and_then(|(hash,)| hash))
    }
}
