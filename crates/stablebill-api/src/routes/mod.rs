//! HTTP routes

pub mod health;
pub mod subscriptions;
pub mod webhook;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use stablebill_core::Error;

/// Map an engine error onto the wire: payment-class messages travel
/// verbatim, system-class messages are sanitized.
pub fn error_response(err: Error) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    if status.is_server_error() {
        tracing::error!(category = err.category(), error = %err, "request failed");
    }

    (
        status,
        Json(serde_json::json!({
            "error": err.public_message(),
        })),
    )
        .into_response()
}
