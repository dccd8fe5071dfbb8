//! Device lifecycle: register, heartbeat, unregister, listing.

use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::envelope::is_valid_id;
use crate::error::RelayError;
use crate::registry::RegisterRequest;
use crate::RelayState;

/// Optional body of `POST /heartbeat/{device_id}`.
#[derive(Debug, Default, Deserialize)]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub local_ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// `POST /register` — insert or refresh a device record.
pub async fn register(
    State(state): State<RelayState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<Value>, RelayError> {
    if !is_valid_id(&req.device_id) {
        return Err(RelayError::MalformedEnvelope("invalid device id format".into()));
    }
    if req.email.trim().is_empty() {
        return Err(RelayError::MalformedEnvelope("email is required".into()));
    }
    let record = state.registry.register(req).await;
    Ok(Json(json!({
        "status": "ok",
        "message": "Device registered",
        "device": record,
    })))
}

/// `POST /heartbeat/{device_id}` — refresh liveness.
///
/// The body is optional; an empty body keeps the stored address.
pub async fn heartbeat(
    State(state): State<RelayState>,
    Path(device_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, RelayError> {
    let hb: HeartbeatRequest = if body.iter().all(u8::is_ascii_whitespace) {
        HeartbeatRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| RelayError::MalformedEnvelope(format!("invalid heartbeat body: {e}")))?
    };
    state
        .registry
        .heartbeat(&device_id, hb.local_ip, hb.port)
        .await?;
    Ok(Json(json!({"status": "ok"})))
}

/// `DELETE /unregister/{device_id}` — mark offline and answer everything
/// still outstanding for the device.
pub async fn unregister(
    State(state): State<RelayState>,
    Path(device_id): Path<String>,
) -> Result<Json<Value>, RelayError> {
    if !state.registry.unregister(&device_id).await {
        return Err(RelayError::UnknownDevice(device_id));
    }
    let drained = state
        .mailbox
        .drain_device(&device_id, "device unregistered")
        .await;
    if drained > 0 {
        info!(device_id = %device_id, drained, "Answered outstanding requests on unregister");
    }
    Ok(Json(json!({"status": "ok", "drained": drained})))
}

/// `GET /devices` — every known device.
pub async fn list_all(State(state): State<RelayState>) -> Json<Value> {
    let devices = state.registry.list_all().await;
    Json(json!({"devices": devices}))
}

/// `GET /devices/{email}` — devices owned by one identity.
pub async fn list_by_email(
    State(state): State<RelayState>,
    Path(email): Path<String>,
) -> Json<Value> {
    let devices = state.registry.list_by_email(&email).await;
    Json(json!({"devices": devices}))
}
