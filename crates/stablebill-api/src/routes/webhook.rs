//! Webhook endpoint management
//!
//! One endpoint per account. Every PUT regenerates the HMAC secret and
//! returns it; the merchant verifies `X-Signature` with it from then on.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::put;
use axum::{Extension, Json, Router};
use rand::Rng;
use serde::Deserialize;

use crate::middleware::AuthedAccount;
use crate::routes::error_response;
use crate::state::AppState;
use stablebill_core::Error;

#[derive(Debug, Deserialize)]
pub struct SetWebhookRequest {
    pub url: String,
}

fn generate_secret() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..32).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

/// PUT /v1/webhook
async fn set_webhook(
    State(state): State<AppState>,
    Extension(AuthedAccount(account)): Extension<AuthedAccount>,
    Json(request): Json<SetWebhookRequest>,
) -> Response {
    if !request.url.starts_with("https://") {
        return error_response(Error::validation("webhook url must be https"));
    }

    if url::Url::parse(&request.url).is_err() {
        return error_response(Error::validation("invalid webhook url"));
    }

    let secret = generate_secret();
    match state
        .webhook_endpoints
        .upsert(account.id, &request.url, &secret)
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "secret": secret })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/v1/webhook", put(set_webhook))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_secret_is_32_bytes_hex() {
        let secret = generate_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(secret, generate_secret());
    }
}
