//! Relay error taxonomy.
//!
//! Every variant maps to a definite HTTP status and a machine-readable `code`,
//! rendered as `{"error": "...", "code": "..."}`. Synthetic error envelopes
//! built on the device side use the same body shape.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Errors surfaced by the Registry, the Mailbox and the HTTP boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The device id has never registered.
    UnknownDevice(String),
    /// The device is known but outside its liveness window (or retired).
    DeviceOffline(String),
    /// No outstanding request with this id (never enqueued, resolved or expired).
    UnknownRequest(String),
    /// No response arrived within the wait window.
    DispatchTimeout(String),
    /// Rejected at the boundary, never enqueued.
    MalformedEnvelope(String),
    /// Decoded body exceeds `server.max_body_bytes`.
    PayloadTooLarge { size: usize, limit: usize },
    /// The device's pending queue is at capacity.
    QueueFull(String),
    /// A device tried to answer a request addressed to another device.
    DeviceMismatch { request_id: String, responder: String },
    /// Another caller is already waiting on this request id.
    AlreadyAwaited(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnknownDevice(_) | Self::UnknownRequest(_) => StatusCode::NOT_FOUND,
            Self::DeviceOffline(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::DispatchTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::MalformedEnvelope(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::QueueFull(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::DeviceMismatch { .. } => StatusCode::FORBIDDEN,
            Self::AlreadyAwaited(_) => StatusCode::CONFLICT,
        }
    }

    /// Stable error code carried in the JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownDevice(_) => "DEVICE_NOT_FOUND",
            Self::DeviceOffline(_) => "DEVICE_OFFLINE",
            Self::UnknownRequest(_) => "REQUEST_NOT_FOUND",
            Self::DispatchTimeout(_) => "TIMEOUT",
            Self::MalformedEnvelope(_) => "INVALID_REQUEST",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::QueueFull(_) => "QUEUE_FULL",
            Self::DeviceMismatch { .. } => "DEVICE_MISMATCH",
            Self::AlreadyAwaited(_) => "ALREADY_AWAITED",
        }
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownDevice(id) => write!(f, "Device '{id}' not found"),
            Self::DeviceOffline(id) => write!(f, "Device '{id}' is offline"),
            Self::UnknownRequest(id) => write!(f, "No outstanding request '{id}'"),
            Self::DispatchTimeout(id) => write!(f, "Device did not respond in time to '{id}'"),
            Self::MalformedEnvelope(msg) => write!(f, "Malformed envelope: {msg}"),
            Self::PayloadTooLarge { size, limit } => {
                write!(f, "Payload too large ({size} bytes, limit {limit})")
            }
            Self::QueueFull(id) => write!(f, "Request queue for device '{id}' is full"),
            Self::DeviceMismatch {
                request_id,
                responder,
            } => write!(
                f,
                "Device '{responder}' may not answer request '{request_id}'"
            ),
            Self::AlreadyAwaited(id) => write!(f, "Request '{id}' already has a waiter"),
        }
    }
}

impl std::error::Error for RelayError {}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = json!({"error": self.to_string(), "code": self.code()});
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_and_code_pairs() {
        let err = RelayError::DispatchTimeout("r1".into());
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.code(), "TIMEOUT");

        let err = RelayError::PayloadTooLarge {
            size: 10,
            limit: 5,
        };
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(err.to_string().contains("limit 5"));
    }

    #[test]
    fn unknown_device_renders_json_body() {
        let resp = RelayError::UnknownDevice("D1".into()).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
