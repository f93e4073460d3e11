//! CDP spend-permissions provider
//!
//! HTTP adapter over the CDP spend-permission API. Charge failures come
//! back as free-text messages; they are passed through untouched so the
//! classifier sees the provider's own wording.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::provider::{ChargeReceipt, OnchainProvider, SubscriptionState};
use crate::{Error, Result};

pub struct CdpProvider {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl CdpProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.charge_timeout_secs))
            .build()
            .map_err(|e| Error::config(format!("Failed to build provider client: {}", e)))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            client,
        })
    }

    /// Turn a non-2xx response into the adapter's error shape.
    ///
    /// 5xx keeps the literal "error code: 5xx" prefix the classifier keys
    /// on; 4xx bodies are payment errors and travel verbatim.
    async fn error_from_response(response: reqwest::Response) -> Error {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());

        if status.is_server_error() {
            Error::provider(format!("error code: {}: {}", status.as_u16(), body))
        } else {
            Error::payment(body)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChargeResponse {
    transaction_hash: String,
    success: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    is_subscribed: bool,
    subscription_owner: Option<String>,
    remaining_charge_in_period: Option<String>,
    current_period_start: Option<i64>,
    next_period_start: Option<i64>,
    recurring_charge: String,
    period_in_seconds: Option<i64>,
}

fn parse_amount(raw: &str, field: &str) -> Result<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| Error::provider(format!("Unparseable {} from provider: {}", field, e)))
}

fn parse_timestamp(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

#[async_trait]
impl OnchainProvider for CdpProvider {
    fn id(&self) -> &'static str {
        "cdp"
    }

    async fn charge(
        &self,
        subscription_id: &str,
        amount: Decimal,
        recipient: &str,
    ) -> Result<ChargeReceipt> {
        let url = format!(
            "{}/v2/spend-permissions/{}/charge",
            self.base_url, subscription_id
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "amount": amount.to_string(),
                "recipient": recipient,
            }))
            .send()
            .await
            .map_err(|e| Error::network(format!("Provider request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let charge: ChargeResponse = response
            .json()
            .await
            .map_err(|e| Error::provider(format!("Malformed charge response: {}", e)))?;

        if !charge.success {
            return Err(Error::payment("charge reported unsuccessful"));
        }

        Ok(ChargeReceipt {
            transaction_hash: charge.transaction_hash,
        })
    }

    async fn get_status(&self, subscription_id: &str) -> Result<SubscriptionState> {
        let url = format!(
            "{}/v2/spend-permissions/{}/status",
            self.base_url, subscription_id
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| Error::network(format!("Provider request failed: {}", e)))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(SubscriptionState::missing());
        }

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let status: StatusResponse = response
            .json()
            .await
            .map_err(|e| Error::provider(format!("Malformed status response: {}", e)))?;

        // The indexer omits every period field when the permission does not
        // exist; the period length is the marker.
        let permission_exists = status.period_in_seconds.is_some();

        Ok(SubscriptionState {
            is_subscribed: status.is_subscribed,
            subscription_owner: status.subscription_owner,
            remaining_charge_in_period: status
                .remaining_charge_in_period
                .as_deref()
                .map(|raw| parse_amount(raw, "remainingChargeInPeriod"))
                .transpose()?,
            current_period_start: status.current_period_start.and_then(parse_timestamp),
            next_period_start: status.next_period_start.and_then(parse_timestamp),
            recurring_charge: parse_amount(&status.recurring_charge, "recurringCharge")?,
            period_in_seconds: status.period_in_seconds,
            permission_exists,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: String) -> ProviderConfig {
        ProviderConfig {
            base_url,
            api_key: "test-key".to_string(),
            spender_address: "0xspender".to_string(),
            charge_timeout_secs: 5,
        }
    }

    fn sub_id() -> String {
        format!("0x{}", "ab".repeat(32))
    }

    #[tokio::test]
    async fn test_charge_success() {
        let server = MockServer::start().await;
        let sub = sub_id();

        Mock::given(method("POST"))
            .and(path(format!("/v2/spend-permissions/{}/charge", sub)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "transactionHash": "0xTX1",
                "success": true,
            })))
            .mount(&server)
            .await;

        let provider = CdpProvider::new(&test_config(server.uri())).unwrap();
        let receipt = provider
            .charge(&sub, Decimal::new(5, 1), "0xbeef")
            .await
            .unwrap();
        assert_eq!(receipt.transaction_hash, "0xTX1");
    }

    #[tokio::test]
    async fn test_charge_payment_error_passes_message_through() {
        let server = MockServer::start().await;
        let sub = sub_id();

        Mock::given(method("POST"))
            .and(path(format!("/v2/spend-permissions/{}/charge", sub)))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string("ERC20: transfer amount exceeds balance"),
            )
            .mount(&server)
            .await;

        let provider = CdpProvider::new(&test_config(server.uri())).unwrap();
        let err = provider
            .charge(&sub, Decimal::ONE, "0xbeef")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ERC20: transfer amount exceeds balance"));
    }

    #[tokio::test]
    async fn test_charge_server_error_keeps_status_code() {
        let server = MockServer::start().await;
        let sub = sub_id();

        Mock::given(method("POST"))
            .and(path(format!("/v2/spend-permissions/{}/charge", sub)))
            .respond_with(ResponseTemplate::new(503).set_body_string("service unavailable"))
            .mount(&server)
            .await;

        let provider = CdpProvider::new(&test_config(server.uri())).unwrap();
        let err = provider
            .charge(&sub, Decimal::ONE, "0xbeef")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("error code: 503"));
    }

    #[tokio::test]
    async fn test_get_status_full_shape() {
        let server = MockServer::start().await;
        let sub = sub_id();

        Mock::given(method("GET"))
            .and(path(format!("/v2/spend-permissions/{}/status", sub)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "isSubscribed": true,
                "subscriptionOwner": "0xspender",
                "remainingChargeInPeriod": "0.5",
                "currentPeriodStart": 1_700_000_000,
                "nextPeriodStart": 1_700_000_060,
                "recurringCharge": "1.0",
                "periodInSeconds": 60,
            })))
            .mount(&server)
            .await;

        let provider = CdpProvider::new(&test_config(server.uri())).unwrap();
        let state = provider.get_status(&sub).await.unwrap();
        assert!(state.permission_exists);
        assert!(state.is_subscribed);
        assert_eq!(state.remaining_charge_in_period, Some(Decimal::new(5, 1)));
        assert_eq!(state.period_in_seconds, Some(60));
    }

    #[tokio::test]
    async fn test_get_status_absent_permission() {
        let server = MockServer::start().await;
        let sub = sub_id();

        Mock::given(method("GET"))
            .and(path(format!("/v2/spend-permissions/{}/status", sub)))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "isSubscribed": false,
                "recurringCharge": "0",
            })))
            .mount(&server)
            .await;

        let provider = CdpProvider::new(&test_config(server.uri())).unwrap();
        let state = provider.get_status(&sub).await.unwrap();
        assert!(!state.permission_exists);
        assert!(!state.is_subscribed);
        assert_eq!(state.recurring_charge, Decimal::ZERO);
        assert!(state.next_period_start.is_none());
    }
}
