//! API key authentication middleware
//!
//! Resolves `Authorization: Bearer <key>` to a merchant account by SHA-256
//! hash lookup. Key issuance and rotation live outside the engine.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use sha2::{Digest, Sha256};

use crate::state::AppState;
use stablebill_core::repository::Account;

/// Authenticated account, injected as a request extension
#[derive(Debug, Clone)]
pub struct AuthedAccount(pub Account);

/// Hash an API key the way the store persists it
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

pub async fn api_key_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let key = request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let account = state
        .accounts
        .find_by_api_key_hash(&hash_api_key(key))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "api key lookup failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    request.extensions_mut().insert(AuthedAccount(account));
    Ok(next.run(request).await)
}
