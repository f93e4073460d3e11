//! Subscription API routes
//!
//! Registration returns as soon as the activation charge is in flight; the
//! merchant follows progress through webhooks.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json, Router};

use crate::middleware::AuthedAccount;
use crate::routes::error_response;
use crate::state::AppState;
use stablebill_core::models::RegisterSubscriptionRequest;

/// POST /v1/subscriptions
async fn register_subscription(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    Json(request): Json<RegisterSubscriptionRequest>,
) -> Response {
    let beneficiary = request
        .beneficiary
        .clone()
        .unwrap_or_else(|| account.payout_address.clone());

    match state
        .activation
        .register(account.id, beneficiary, request)
        .await
    {
        Ok(()) => (
            StatusCode::CREATED,
            Json(serde_json::json!({ "status": "processing" })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

/// DELETE /v1/subscriptions/:id
async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    Path(id): Path<String>,
) -> Response {
    match state.activation.cancel(account.id, &id).await {
        Ok(subscription) => (StatusCode::OK, Json(subscription)).into_response(),
        Err(e) => error_response(e),
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/subscriptions", post(register_subscription))
        .route(
            "/v1/subscriptions/:id",
            axum::routing::delete(cancel_subscription),
        )
}
