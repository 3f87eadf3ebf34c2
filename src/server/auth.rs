//! Shared-secret authentication for the management API.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use secrecy::ExposeSecret;
use tracing::warn;

use super::routes::AppState;

/// Header carrying the shared secret.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Reject requests without the configured `x-api-key` header.
///
/// An empty configured secret disables auth (logged loudly). The liveness
/// probe is mounted outside this layer and stays open.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let secret = state.config.api_secret_key.expose_secret();
    if secret.is_empty() {
        warn!("API secret not configured - auth disabled");
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(key) if key == secret => next.run(request).await,
        _ => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({
                "error": "Unauthorized",
                "message": "Invalid or missing API key"
            })),
        )
            .into_response(),
    }
}
