//! Subscription model
//!
//! A subscription is a registered onchain spending permission the engine
//! charges against on a recurring cadence. Its identity is the 32-byte
//! permission hash assigned by the provider, not a surrogate id.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

use crate::{Error, Result};

/// Subscription status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Registered, activation charge in flight
    Processing,
    /// Activation charge paid, billing on cadence
    Active,
    /// Recoverable payment failure, dunning in progress
    PastDue,
    /// Dunning exhausted; no further charges attempted
    Unpaid,
    /// Activation charge failed; merchant must re-register
    Incomplete,
    /// Terminal error or explicit revoke
    Canceled,
}

impl SubscriptionStatus {
    /// Terminal statuses accept no further charges
    pub fn is_billable(&self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::PastDue)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SubscriptionStatus::Processing => "processing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Incomplete => "incomplete",
            SubscriptionStatus::Canceled => "canceled",
        };
        write!(f, "{}", s)
    }
}

/// Subscription entity
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    /// Onchain permission id (0x + 64 hex chars)
    pub subscription_id: String,
    /// Merchant account that owns webhooks for this subscription
    pub account_id: Uuid,
    /// Payout recipient
    pub beneficiary_address: String,
    /// Provider tag (e.g. "base")
    pub provider: String,
    pub testnet: bool,
    pub status: SubscriptionStatus,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Registration request body for POST /v1/subscriptions
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RegisterSubscriptionRequest {
    #[serde(rename = "subscriptionId")]
    pub subscription_id: String,

    #[validate(length(min = 1, max = 64))]
    pub provider: String,

    #[serde(default)]
    pub testnet: bool,

    /// Defaults to the merchant account's payout address when absent
    pub beneficiary: Option<String>,
}

lazy_static! {
    static ref SUBSCRIPTION_ID_RE: Regex = Regex::new(r"^0x[0-9a-fA-F]{64}$").unwrap();
}

/// Validate the opaque 32-byte permission hash format
pub fn validate_subscription_id(id: &str) -> Result<()> {
    if SUBSCRIPTION_ID_RE.is_match(id) {
        Ok(())
    } else {
        Err(Error::validation("subscriptionId must be a 0x-prefixed 32-byte hash"))
    }
}
