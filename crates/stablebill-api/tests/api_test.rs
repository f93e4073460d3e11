//! HTTP surface tests against the memory repositories and mock provider

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use rust_decimal_macros::dec;
use tower::ServiceExt;
use uuid::Uuid;

use stablebill_api::middleware::{api_key_auth, hash_api_key};
use stablebill_api::routes::{health, subscriptions, webhook};
use stablebill_api::AppState;
use stablebill_core::billing::ActivationOrchestrator;
use stablebill_core::provider::{ChargeReceipt, MockProvider, SubscriptionState};
use stablebill_core::queue::memory::MemorySink;
use stablebill_core::queue::ChargeMessage;
use stablebill_core::repository::{
    Account, AccountRepository, BillingStore, MemoryAccountRepository, MemoryBillingStore,
    MemoryTimerRepository, MemoryWebhookEndpointRepository, WebhookEndpointRepository,
};
use stablebill_core::scheduler::{OrderScheduler, SchedulerConfig};
use stablebill_core::webhooks::{DeliveryTask, WebhookEmitter};

const SPENDER: &str = "0xEngineSpender";
const API_KEY: &str = "sk_test_valid";

struct TestApp {
    app: Router,
    provider: Arc<MockProvider>,
    activation: Arc<ActivationOrchestrator>,
}

fn subscribed_state() -> SubscriptionState {
    let now = Utc::now();
    SubscriptionState {
        is_subscribed: true,
        subscription_owner: Some(SPENDER.to_string()),
        remaining_charge_in_period: Some(dec!(0.5)),
        current_period_start: Some(now),
        next_period_start: Some(now + Duration::seconds(60)),
        recurring_charge: dec!(1.0),
        period_in_seconds: Some(60),
        permission_exists: true,
    }
}

fn build_app() -> TestApp {
    let store: Arc<dyn BillingStore> = Arc::new(MemoryBillingStore::new());
    let timers = Arc::new(MemoryTimerRepository::new());
    let provider = Arc::new(MockProvider::new());
    let endpoints: Arc<dyn WebhookEndpointRepository> =
        Arc::new(MemoryWebhookEndpointRepository::new());

    let accounts_impl = Arc::new(MemoryAccountRepository::new());
    accounts_impl.insert_account(
        Account {
            id: Uuid::new_v4(),
            name: "merchant".to_string(),
            payout_address: "0xmerchantpayout".to_string(),
        },
        Some(&hash_api_key(API_KEY)),
    );
    let accounts: Arc<dyn AccountRepository> = accounts_impl;

    let scheduler = Arc::new(OrderScheduler::new(
        timers,
        Arc::new(MemorySink::<ChargeMessage>::new()),
        SchedulerConfig::default(),
    ));
    let emitter = Arc::new(WebhookEmitter::new(
        endpoints.clone(),
        Arc::new(MemorySink::<DeliveryTask>::new()),
    ));
    let activation = Arc::new(ActivationOrchestrator::new(
        store,
        provider.clone(),
        scheduler,
        emitter,
        SPENDER.to_string(),
    ));

    let state = AppState::new(activation.clone(), accounts, endpoints);
    let protected = Router::new()
        .merge(subscriptions::router())
        .merge(webhook::router())
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            api_key_auth,
        ));
    let app = Router::new()
        .merge(protected)
        .merge(health::router())
        .with_state(state);

    TestApp {
        app,
        provider,
        activation,
    }
}

fn sub_id(tag: u8) -> String {
    format!("0x{}", format!("{:02x}", tag).repeat(32))
}

fn register_request(sub_id: &str, key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/subscriptions")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(key) = key {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", key));
    }
    builder
        .body(Body::from(
            serde_json::json!({
                "subscriptionId": sub_id,
                "provider": "base",
                "testnet": false,
            })
            .to_string(),
        ))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn health_is_open() {
    let test = build_app();
    let response = test
        .app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn registration_requires_api_key() {
    let test = build_app();
    let response = test
        .app
        .oneshot(register_request(&sub_id(1), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn wrong_api_key_is_rejected() {
    let test = build_app();
    let response = test
        .app
        .oneshot(register_request(&sub_id(1), Some("sk_test_wrong")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn registration_returns_processing() {
    let test = build_app();
    test.provider.set_status(subscribed_state());
    test.provider.push_charge_result(Ok(ChargeReceipt {
        transaction_hash: "0xTX1".to_string(),
    }));

    let response = test
        .app
        .clone()
        .oneshot(register_request(&sub_id(2), Some(API_KEY)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["status"], "processing");

    test.activation.drain().await;
}

#[tokio::test]
async fn duplicate_registration_is_a_conflict() {
    let test = build_app();
    test.provider.set_status(subscribed_state());

    let sub = sub_id(3);
    let response = test
        .app
        .clone()
        .oneshot(register_request(&sub, Some(API_KEY)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = test
        .app
        .clone()
        .oneshot(register_request(&sub, Some(API_KEY)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response).await;
    assert_eq!(body["error"], "subscription_exists");

    test.activation.drain().await;
}

#[tokio::test]
async fn malformed_subscription_id_is_rejected() {
    let test = build_app();
    let response = test
        .app
        .oneshot(register_request("0x1234", Some(API_KEY)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn inactive_permission_is_forbidden() {
    let test = build_app();
    test.provider.set_status(SubscriptionState::missing());

    let response = test
        .app
        .oneshot(register_request(&sub_id(4), Some(API_KEY)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["error"], "subscription_not_active");
}

#[tokio::test]
async fn cancel_returns_the_canceled_subscription() {
    let test = build_app();
    test.provider.set_status(subscribed_state());
    test.provider.push_charge_result(Ok(ChargeReceipt {
        transaction_hash: "0xTX1".to_string(),
    }));

    let sub = sub_id(5);
    test.app
        .clone()
        .oneshot(register_request(&sub, Some(API_KEY)))
        .await
        .unwrap();
    test.activation.drain().await;

    let response = test
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/subscriptions/{}", sub))
                .header(header::AUTHORIZATION, format!("Bearer {}", API_KEY))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "canceled");
}

#[tokio::test]
async fn cancel_unknown_subscription_is_not_found() {
    let test = build_app();
    let response = test
        .app
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/subscriptions/{}", sub_id(6)))
                .header(header::AUTHORIZATION, format!("Bearer {}", API_KEY))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn webhook_endpoint_requires_https() {
    let test = build_app();
    let response = test
        .app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/v1/webhook")
                .header(header::AUTHORIZATION, format!("Bearer {}", API_KEY))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"url": "http://merchant.example/hooks"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn webhook_endpoint_update_returns_secret() {
    let test = build_app();
    let response = test
        .app
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/v1/webhook")
                .header(header::AUTHORIZATION, format!("Bearer {}", API_KEY))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"url": "https://merchant.example/hooks"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let secret = body["secret"].as_str().unwrap();
    assert_eq!(secret.len(), 64);
}
