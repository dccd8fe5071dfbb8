//! Unauthenticated health-check and banner endpoints.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::RelayState;

/// `GET /health` — liveness check.
///
/// Returns status, uptime, version, device counts and mailbox counters. No
/// authentication required, suitable for load-balancer health checks.
pub async fn health(State(state): State<RelayState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let (devices, online) = state.registry.counts().await;
    let mailbox = state.mailbox.stats().await;

    Json(json!({
        "status": "healthy",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "devices": devices,
        "devices_online": online,
        "mailbox": mailbox,
    }))
}

/// `GET /` — service banner.
pub async fn root(State(state): State<RelayState>) -> Json<Value> {
    let (devices, _) = state.registry.counts().await;
    Json(json!({
        "service": "burrow relay",
        "status": "running",
        "devices_count": devices,
        "mode": "full_proxy",
    }))
}
