//! Webhook emission
//!
//! Every state transition emits one logical event, `subscription.updated`,
//! whose `data` sub-objects tell the merchant what happened. The payload is
//! serialized once, signed once (HMAC-SHA256 over `timestamp || "." ||
//! payload`), and the same bytes travel on every delivery attempt.
//!
//! Emission is fire-and-forget from the caller's perspective: a failed
//! enqueue is logged and swallowed so it can never fail a billing
//! transaction.

pub mod delivery;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::models::SubscriptionStatus;
use crate::queue::MessageSink;
use crate::repository::WebhookEndpointRepository;
use crate::Result;

type HmacSha256 = Hmac<Sha256>;

/// Wire event type; the payload's sub-objects carry the specifics
pub const EVENT_TYPE: &str = "subscription.updated";

/// Outbound webhook event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub r#type: String,
    pub created_at: i64,
    pub data: EventData,
}

impl WebhookEvent {
    pub fn new(data: EventData, created_at: DateTime<Utc>) -> Self {
        Self {
            r#type: EVENT_TYPE.to_string(),
            created_at: created_at.timestamp(),
            data,
        }
    }
}

/// Event payload; optional sub-objects are omitted from the JSON entirely
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub subscription: SubscriptionData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<OrderData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorData>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub id: String,
    pub status: SubscriptionStatus,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub period_in_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderData {
    pub number: i32,
    #[serde(rename = "type")]
    pub r#type: crate::models::OrderType,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    /// "paid" or "failed"
    pub status: String,
    /// Start of the just-charged period
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_period_start: Option<i64>,
    /// End of the just-charged period (due_at + period length)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionData {
    pub hash: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub amount: Decimal,
    pub processed_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: String,
    pub message: String,
}

/// Queued delivery: signed once at emission, immutable afterwards
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryTask {
    pub url: String,
    pub payload: String,
    pub signature: String,
    pub timestamp: i64,
}

/// Compute the delivery signature: hex(hmac-sha256(secret, ts + "." + payload))
pub fn sign_payload(secret: &str, timestamp: i64, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Assembles, signs, and enqueues webhook events
pub struct WebhookEmitter {
    endpoints: Arc<dyn WebhookEndpointRepository>,
    sink: Arc<dyn MessageSink<DeliveryTask>>,
}

impl WebhookEmitter {
    pub fn new(
        endpoints: Arc<dyn WebhookEndpointRepository>,
        sink: Arc<dyn MessageSink<DeliveryTask>>,
    ) -> Self {
        Self { endpoints, sink }
    }

    /// Emit an event to the account's endpoint.
    ///
    /// Accounts without an enabled endpoint are skipped silently; enqueue
    /// failures are logged and swallowed.
    pub async fn emit(&self, account_id: Uuid, data: EventData) {
        if let Err(e) = self.try_emit(account_id, data).await {
            error!(%account_id, error = %e, "webhook emission failed");
        }
    }

    async fn try_emit(&self, account_id: Uuid, data: EventData) -> Result<()> {
        let Some(endpoint) = self.endpoints.get(account_id).await? else {
            debug!(%account_id, "no webhook endpoint configured");
            return Ok(());
        };

        if !endpoint.enabled {
            debug!(%account_id, "webhook endpoint disabled");
            return Ok(());
        }

        let now = Utc::now();
        let event = WebhookEvent::new(data, now);
        let payload = serde_json::to_string(&event)?;
        let timestamp = now.timestamp();
        let signature = sign_payload(&endpoint.secret, timestamp, &payload);

        let task = DeliveryTask {
            url: endpoint.url,
            payload,
            signature,
            timestamp,
        };

        self.sink.push(&task).await?;
        debug!(%account_id, "webhook enqueued");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::{FailingSink, MemorySink};
    use crate::repository::MemoryWebhookEndpointRepository;
    use rust_decimal_macros::dec;

    fn subscription_data() -> SubscriptionData {
        SubscriptionData {
            id: format!("0x{}", "aa".repeat(32)),
            status: SubscriptionStatus::Active,
            amount: dec!(1.0),
            period_in_seconds: 60,
        }
    }

    fn event_data() -> EventData {
        EventData {
            subscription: subscription_data(),
            order: None,
            transaction: None,
            error: None,
        }
    }

    #[test]
    fn test_signature_is_stable_for_same_inputs() {
        let payload = r#"{"type":"subscription.updated"}"#;
        let a = sign_payload("secret", 1700000000, payload);
        let b = sign_payload("secret", 1700000000, payload);
        assert_eq!(a, b);
        // signature covers the timestamp
        assert_ne!(a, sign_payload("secret", 1700000001, payload));
        // and the secret
        assert_ne!(a, sign_payload("other", 1700000000, payload));
    }

    #[test]
    fn test_optional_sub_objects_are_omitted() {
        let event = WebhookEvent::new(event_data(), Utc::now());
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"subscription.updated""#));
        assert!(json.contains(r#""subscription""#));
        assert!(!json.contains(r#""order""#));
        assert!(!json.contains(r#""transaction""#));
        assert!(!json.contains(r#""error""#));
    }

    #[test]
    fn test_order_sub_object_serializes_period_fields() {
        let mut data = event_data();
        data.order = Some(OrderData {
            number: 2,
            r#type: crate::models::OrderType::Recurring,
            amount: dec!(1.0),
            status: "paid".to_string(),
            current_period_start: Some(1_700_000_000),
            current_period_end: Some(1_700_000_060),
            next_retry_at: None,
        });
        let json = serde_json::to_string(&WebhookEvent::new(data, Utc::now())).unwrap();
        assert!(json.contains(r#""number":2"#));
        assert!(json.contains(r#""current_period_end":1700000060"#));
        assert!(!json.contains("next_retry_at"));
    }

    #[tokio::test]
    async fn test_emit_signs_and_enqueues() {
        let endpoints = Arc::new(MemoryWebhookEndpointRepository::new());
        let account_id = Uuid::new_v4();
        endpoints
            .upsert(account_id, "https://merchant.example/hooks", "whsec_test")
            .await
            .unwrap();

        let sink = Arc::new(MemorySink::<DeliveryTask>::new());
        let emitter = WebhookEmitter::new(endpoints, sink.clone());

        emitter.emit(account_id, event_data()).await;

        let tasks = sink.items().await;
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(task.url, "https://merchant.example/hooks");
        assert_eq!(
            task.signature,
            sign_payload("whsec_test", task.timestamp, &task.payload)
        );
    }

    #[tokio::test]
    async fn test_emit_without_endpoint_is_a_noop() {
        let endpoints = Arc::new(MemoryWebhookEndpointRepository::new());
        let sink = Arc::new(MemorySink::<DeliveryTask>::new());
        let emitter = WebhookEmitter::new(endpoints, sink.clone());

        emitter.emit(Uuid::new_v4(), event_data()).await;
        assert_eq!(sink.len().await, 0);
    }

    #[tokio::test]
    async fn test_emit_swallows_enqueue_failure() {
        let endpoints = Arc::new(MemoryWebhookEndpointRepository::new());
        let account_id = Uuid::new_v4();
        endpoints
            .upsert(account_id, "https://merchant.example/hooks", "whsec_test")
            .await
            .unwrap();

        let emitter = WebhookEmitter::new(endpoints, Arc::new(FailingSink));
        // must not panic or propagate
        emitter.emit(account_id, event_data()).await;
    }
}
