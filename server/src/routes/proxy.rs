//! Mailbox endpoints: clients send and await, devices poll and respond.
//!
//! The transparent `/d/{device_id}/*` route stitches both halves together for
//! plain HTTP callers: the request is enqueued, the handler waits for the
//! correlated response and replays it as an ordinary HTTP response.

use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, Multipart, Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::envelope::{
    is_valid_id, strip_hop_by_hop, PollResponse, RequestEnvelope, RespondAck, ResponseEnvelope,
    SendAccepted, SendRequest,
};
use crate::error::RelayError;
use crate::mailbox::{OnTimeout, Resolution};
use crate::RelayState;

#[derive(Debug, Default, Deserialize)]
pub struct PollQuery {
    /// Requested long-poll wait; clamped to `relay.max_poll_wait_ms`.
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AwaitQuery {
    /// Requested wait; clamped to `relay.max_await_ms`.
    pub timeout_ms: Option<u64>,
}

/// `POST /proxy/send` (alias `/send`) — validate and enqueue for a device.
pub async fn send(
    State(state): State<RelayState>,
    Json(req): Json<SendRequest>,
) -> Result<Json<SendAccepted>, RelayError> {
    let from = req.from.clone();
    let envelope = req.into_envelope();
    envelope.validate(state.max_body_bytes())?;

    if state.config.relay.reject_unknown_devices
        && !state.registry.contains(&envelope.device_id).await
    {
        return Err(RelayError::UnknownDevice(envelope.device_id));
    }

    info!(
        request_id = %envelope.request_id,
        device_id = %envelope.device_id,
        from = from.as_deref().unwrap_or("-"),
        method = %envelope.method,
        path = %envelope.path,
        "Request queued"
    );
    let request_id = state.mailbox.enqueue(envelope).await?;
    Ok(Json(SendAccepted {
        status: "accepted".into(),
        request_id,
    }))
}

/// `GET /proxy/poll/{device_id}` (alias `/poll/{device_id}`) — long-poll for work.
///
/// Returns immediately when requests are queued, otherwise parks until one
/// arrives or the wait elapses (then `{"requests": []}`).
pub async fn poll(
    State(state): State<RelayState>,
    Path(device_id): Path<String>,
    Query(query): Query<PollQuery>,
) -> Result<Json<PollResponse>, RelayError> {
    if !is_valid_id(&device_id) {
        return Err(RelayError::MalformedEnvelope("invalid device id format".into()));
    }
    let wait = state.poll_wait(query.wait_ms);
    let requests = state.mailbox.poll(&device_id, wait).await;
    Ok(Json(PollResponse { requests }))
}

/// `POST /proxy/respond` — a device answers a dispatched request.
///
/// Unknown, late, duplicate or undispatched responses are acknowledged with
/// `delivered: false` and dropped.
pub async fn respond(
    State(state): State<RelayState>,
    Json(response): Json<ResponseEnvelope>,
) -> Result<Json<RespondAck>, RelayError> {
    response.validate(state.max_body_bytes())?;
    match response.device_id.as_deref() {
        None => return Err(RelayError::MalformedEnvelope("device_id is required".into())),
        Some(responder) if !is_valid_id(responder) => {
            return Err(RelayError::MalformedEnvelope("invalid device id format".into()));
        }
        Some(_) => {}
    }

    let request_id = response.request_id.clone();
    let resolution = state.mailbox.resolve(response).await?;
    match resolution {
        Resolution::Delivered | Resolution::Parked => {
            debug!(request_id = %request_id, ?resolution, "Response accepted");
        }
        Resolution::Duplicate => debug!(request_id = %request_id, "Duplicate response ignored"),
        Resolution::NotDispatched | Resolution::Unknown => {
            warn!(request_id = %request_id, ?resolution, "Dropped response");
        }
    }
    Ok(Json(RespondAck {
        status: "ok".into(),
        delivered: resolution.delivered(),
    }))
}

/// `GET /proxy/await/{request_id}` — block until the device answers.
///
/// A 504 forgets the request, unless `relay.max_await_ms` cut the requested
/// wait short: then the request stays outstanding and the client may await
/// it again for the rest of its own deadline.
pub async fn await_response(
    State(state): State<RelayState>,
    Path(request_id): Path<String>,
    Query(query): Query<AwaitQuery>,
) -> Result<Json<ResponseEnvelope>, RelayError> {
    let (timeout, clamped) = state.await_timeout(query.timeout_ms);
    let on_timeout = if clamped {
        OnTimeout::Keep
    } else {
        OnTimeout::Discard
    };
    let response = state
        .mailbox
        .wait_with(&request_id, timeout, on_timeout)
        .await?;
    Ok(Json(response))
}

/// `DELETE /proxy/requests/{request_id}` — give up on a request.
pub async fn abandon(
    State(state): State<RelayState>,
    Path(request_id): Path<String>,
) -> Result<Json<Value>, RelayError> {
    if !state.mailbox.abandon(&request_id).await {
        return Err(RelayError::UnknownRequest(request_id));
    }
    debug!(request_id = %request_id, "Request abandoned by client");
    Ok(Json(json!({"status": "ok"})))
}

/// `ANY /d/{device_id}/{*path}` — transparent proxy to a device.
///
/// - `404` unknown device, `503` offline device
/// - `504` when the device doesn't answer within `relay.proxy_timeout_secs`
/// - otherwise the device's status, headers and body, verbatim
pub async fn transparent(
    State(state): State<RelayState>,
    Path((device_id, path)): Path<(String, String)>,
    method: Method,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, RelayError> {
    state.registry.check_online(&device_id).await?;

    let mut envelope = RequestEnvelope::new(device_id, method.as_str(), format!("/{path}"))
        .with_body(&body);
    envelope.params = params;
    envelope.headers = forwardable_headers(&headers, state.config.auth.relay_key.is_some());
    envelope.validate(state.max_body_bytes())?;

    let response = state
        .mailbox
        .send_and_wait(envelope, state.proxy_timeout())
        .await?;
    into_http_response(&response)
}

/// Device-side endpoint that receives relayed uploads.
pub const UPLOAD_PATH: &str = "/api/files/upload";

/// `POST /proxy/{device_id}/upload` — multipart file upload to a device.
///
/// Form fields: `file` (required, carries the file name) and `path`, the
/// target directory on the device. Waits up to `relay.upload_timeout_secs`.
pub async fn upload(
    State(state): State<RelayState>,
    Path(device_id): Path<String>,
    mut multipart: Multipart,
) -> Result<Response, RelayError> {
    state.registry.check_online(&device_id).await?;

    let mut dir = String::new();
    let mut file = None;
    while let Some(field) = multipart.next_field().await.map_err(bad_multipart)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "path" => dir = field.text().await.map_err(bad_multipart)?,
            "file" => {
                let name = field.file_name().unwrap_or("upload.bin").to_string();
                let bytes = field.bytes().await.map_err(bad_multipart)?;
                file = Some((name, bytes));
            }
            _ => {}
        }
    }
    let Some((filename, bytes)) = file else {
        return Err(RelayError::MalformedEnvelope("missing 'file' field".into()));
    };

    let envelope = RequestEnvelope::new(device_id, "POST", UPLOAD_PATH)
        .with_param("path", &dir)
        .with_filename(filename)
        .with_body(&bytes);
    envelope.validate(state.max_body_bytes())?;
    info!(
        request_id = %envelope.request_id,
        device_id = %envelope.device_id,
        size = bytes.len(),
        "Upload queued"
    );

    let response = state
        .mailbox
        .send_and_wait(envelope, state.upload_timeout())
        .await?;
    into_http_response(&response)
}

fn bad_multipart(e: MultipartError) -> RelayError {
    RelayError::MalformedEnvelope(format!("invalid multipart body: {}", e.body_text()))
}

/// Request headers worth forwarding to the device.
fn forwardable_headers(headers: &HeaderMap, strip_auth: bool) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = headers
        .iter()
        .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
        .collect();
    strip_hop_by_hop(&mut out);
    // The relay key authenticates the caller to us, not to the device.
    if strip_auth {
        out.remove("authorization");
    }
    out
}

fn into_http_response(envelope: &ResponseEnvelope) -> Result<Response, RelayError> {
    let status = StatusCode::from_u16(envelope.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let body = envelope.body_bytes()?;

    let mut response = (status, body).into_response();
    let out = response.headers_mut();
    let mut headers = envelope.headers.clone();
    strip_hop_by_hop(&mut headers);
    for (k, v) in &headers {
        if k.eq_ignore_ascii_case("content-type") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(k.as_str()), HeaderValue::from_str(v)) {
            out.append(name, value);
        }
    }
    if let Ok(ct) = HeaderValue::from_str(&envelope.content_type) {
        out.insert(axum::http::header::CONTENT_TYPE, ct);
    }
    Ok(response)
}
