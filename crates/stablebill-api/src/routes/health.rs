//! Liveness probe

use axum::routing::get;
use axum::{Json, Router};

use crate::state::AppState;

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": stablebill_core::VERSION,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
