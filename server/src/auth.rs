//! Optional pre-shared relay key.
//!
//! When `auth.relay_key` is set, every endpoint except `/health` and `/`
//! requires an `Authorization: Bearer <key>` header. Devices and client
//! proxies present the same key. With no key configured the relay is open.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Axum middleware that enforces the [`RelayKey`] extension, if one is set.
///
/// # Error responses
///
/// - `401 Unauthorized` — header missing or malformed
/// - `403 Forbidden` — key present but invalid
/// - `500 Internal Server Error` — [`RelayKey`] extension not found (misconfiguration)
pub async fn require_relay_key(request: Request, next: Next) -> Response {
    let expected = match request.extensions().get::<RelayKey>() {
        Some(RelayKey(Some(key))) => key.clone(),
        Some(RelayKey(None)) => return next.run(request).await,
        None => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Server configuration error"})),
            )
                .into_response();
        }
    };

    let provided = match bearer_token(&request) {
        Some(token) => token,
        None => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Missing or invalid Authorization header", "code": "UNAUTHORIZED"})),
            )
                .into_response();
        }
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid relay key", "code": "FORBIDDEN"})),
        )
            .into_response();
    }

    next.run(request).await
}

fn bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        let p = provided.get(i).copied().unwrap_or(0xff);
        diff |= e ^ p;
    }
    diff == 0
}

/// Extension carrying the configured relay key. `None` disables the check.
#[derive(Clone, Default)]
pub struct RelayKey(pub Option<String>);
