//! Order model
//!
//! An order is a single scheduled charge attempt for a subscription. Order
//! numbers are allocated per subscription starting at 1 with no gaps; the
//! store computes them inside the insert statement.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::SubscriptionStatus;

/// Order type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "order_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// First charge, executed during activation
    Initial,
    /// Scheduled charge at the permission's cadence
    Recurring,
}

/// Order status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "order_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Processing,
    Paid,
    Failed,
}

/// Order entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: i64,
    pub subscription_id: String,
    /// Per-subscription sequence, 1..N gap-free
    pub order_number: i32,
    #[sqlx(rename = "order_type")]
    #[serde(rename = "type")]
    pub r#type: OrderType,
    pub due_at: DateTime<Utc>,
    pub amount: Decimal,
    pub period_length_seconds: i64,
    pub status: OrderStatus,
    pub attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Mapped failure code (classifier output)
    pub failure_reason: Option<String>,
    /// Raw provider error, kept for diagnostics only
    pub raw_error: Option<String>,
    pub transaction_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// End of the period this order charges for
    pub fn period_end(&self) -> DateTime<Utc> {
        self.due_at + chrono::Duration::seconds(self.period_length_seconds)
    }
}

/// Claimed order handed to the payment processor by `claim_due_orders` /
/// `get_due_retries`
#[derive(Debug, Clone, FromRow)]
pub struct DueOrder {
    pub order_id: i64,
    pub subscription_id: String,
    pub provider: String,
    pub amount: Decimal,
    pub attempts: i32,
    pub testnet: bool,
}

/// Order joined with its subscription, as loaded by the processor
#[derive(Debug, Clone, FromRow)]
pub struct OrderDetails {
    pub order_id: i64,
    pub subscription_id: String,
    pub order_number: i32,
    #[sqlx(rename = "order_type")]
    pub r#type: OrderType,
    pub due_at: DateTime<Utc>,
    pub amount: Decimal,
    pub period_length_seconds: i64,
    pub status: OrderStatus,
    pub attempts: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub transaction_hash: Option<String>,
    pub subscription_status: SubscriptionStatus,
    pub account_id: Uuid,
    pub beneficiary_address: String,
    pub provider: String,
    pub testnet: bool,
}

impl OrderDetails {
    pub fn period_end(&self) -> DateTime<Utc> {
        self.due_at + chrono::Duration::seconds(self.period_length_seconds)
    }
}

/// Parameters for the first order inserted with a new subscription
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub r#type: OrderType,
    pub due_at: DateTime<Utc>,
    pub amount: Decimal,
    pub period_length_seconds: i64,
    pub status: OrderStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_period_end() {
        let due = Utc::now();
        let order = Order {
            id: 1,
            subscription_id: format!("0x{}", "aa".repeat(32)),
            order_number: 1,
            r#type: OrderType::Recurring,
            due_at: due,
            amount: dec!(1.0),
            period_length_seconds: 60,
            status: OrderStatus::Pending,
            attempts: 0,
            next_retry_at: None,
            failure_reason: None,
            raw_error: None,
            transaction_hash: None,
            created_at: due,
        };
        assert_eq!(order.period_end(), due + chrono::Duration::seconds(60));
    }
}
