//! Onchain payment provider adapter
//!
//! The engine never talks to the chain itself; it calls a provider
//! capability that executes USDC pulls against a spend permission. Provider
//! errors are surfaced as opaque messages; translating them into the
//! engine's taxonomy is the classifier's job.

pub mod cdp;

pub use cdp::CdpProvider;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::Result;

/// Successful charge receipt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargeReceipt {
    pub transaction_hash: String,
}

/// Onchain state of a spend permission.
///
/// When the permission is absent the indexer answers with only
/// `is_subscribed=false` and `recurring_charge=0`; every period field is
/// `None` and `permission_exists` is false. Callers use the distinction to
/// tell "not found" from "revoked".
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionState {
    pub is_subscribed: bool,
    pub subscription_owner: Option<String>,
    pub remaining_charge_in_period: Option<Decimal>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub next_period_start: Option<DateTime<Utc>>,
    pub recurring_charge: Decimal,
    pub period_in_seconds: Option<i64>,
    pub permission_exists: bool,
}

impl SubscriptionState {
    /// An absent permission, as the indexer reports it
    pub fn missing() -> Self {
        Self {
            is_subscribed: false,
            subscription_owner: None,
            remaining_charge_in_period: None,
            current_period_start: None,
            next_period_start: None,
            recurring_charge: Decimal::ZERO,
            period_in_seconds: None,
            permission_exists: false,
        }
    }
}

/// Provider capability used by the billing engine
#[async_trait]
pub trait OnchainProvider: Send + Sync {
    fn id(&self) -> &'static str;

    /// Pull `amount` USDC from the permission to `recipient`
    async fn charge(
        &self,
        subscription_id: &str,
        amount: Decimal,
        recipient: &str,
    ) -> Result<ChargeReceipt>;

    /// Read the permission's current onchain state
    async fn get_status(&self, subscription_id: &str) -> Result<SubscriptionState>;
}

/// Scriptable provider for local development and testing.
///
/// Charge outcomes are consumed front-to-back; when the script runs out the
/// mock keeps succeeding with generated hashes.
pub struct MockProvider {
    status: Mutex<SubscriptionState>,
    charge_script: Mutex<VecDeque<Result<ChargeReceipt>>>,
    charges: Mutex<Vec<(String, Decimal, String)>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            status: Mutex::new(SubscriptionState::missing()),
            charge_script: Mutex::new(VecDeque::new()),
            charges: Mutex::new(Vec::new()),
        }
    }

    pub fn with_status(self, state: SubscriptionState) -> Self {
        *self.status.lock().unwrap() = state;
        self
    }

    pub fn set_status(&self, state: SubscriptionState) {
        *self.status.lock().unwrap() = state;
    }

    /// Queue the outcome of the next charge call
    pub fn push_charge_result(&self, result: Result<ChargeReceipt>) {
        self.charge_script.lock().unwrap().push_back(result);
    }

    /// Every (subscription_id, amount, recipient) charged so far
    pub fn charge_calls(&self) -> Vec<(String, Decimal, String)> {
        self.charges.lock().unwrap().clone()
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OnchainProvider for MockProvider {
    fn id(&self) -> &'static str {
        "mock"
    }

    async fn charge(
        &self,
        subscription_id: &str,
        amount: Decimal,
        recipient: &str,
    ) -> Result<ChargeReceipt> {
        self.charges.lock().unwrap().push((
            subscription_id.to_string(),
            amount,
            recipient.to_string(),
        ));

        let scripted = self.charge_script.lock().unwrap().pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(ChargeReceipt {
                transaction_hash: format!("0xmock{}", uuid::Uuid::new_v4().simple()),
            }),
        }
    }

    async fn get_status(&self, _subscription_id: &str) -> Result<SubscriptionState> {
        Ok(self.status.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_mock_provider_scripted_outcomes() {
        let provider = MockProvider::new();
        provider.push_charge_result(Err(crate::Error::payment("insufficient balance")));
        provider.push_charge_result(Ok(ChargeReceipt {
            transaction_hash: "0xTX2".to_string(),
        }));

        let sub = format!("0x{}", "ab".repeat(32));
        assert!(provider.charge(&sub, dec!(1.0), "0xbeef").await.is_err());
        let receipt = provider.charge(&sub, dec!(1.0), "0xbeef").await.unwrap();
        assert_eq!(receipt.transaction_hash, "0xTX2");
        assert_eq!(provider.charge_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_permission_shape() {
        let state = SubscriptionState::missing();
        assert!(!state.permission_exists);
        assert!(!state.is_subscribed);
        assert_eq!(state.recurring_charge, Decimal::ZERO);
        assert!(state.period_in_seconds.is_none());
    }
}
