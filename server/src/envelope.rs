//! Wire envelopes exchanged through the relay.
//!
//! A [`RequestEnvelope`] carries one HTTP request from a client to a device; a
//! [`ResponseEnvelope`] carries the device's answer back. Bodies travel as
//! standard base64 so arbitrary bytes survive the JSON transport. Both sides of
//! the relay (device agent and client proxy) use these same types.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::RelayError;

/// Longest accepted request path, in bytes.
pub const MAX_PATH_LEN: usize = 2048;
/// Maximum number of headers (and, separately, query params) per envelope.
pub const MAX_HEADERS: usize = 64;
/// Longest accepted device or request id.
pub const MAX_ID_LEN: usize = 128;
/// Longest accepted upload file name, in bytes.
pub const MAX_FILENAME_LEN: usize = 255;

const METHODS: &[&str] = &["GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"];

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "upgrade",
];

/// A request queued for a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: String,
    /// Target device.
    pub device_id: String,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub params: HashMap<String, String>,
    /// Base64 body, absent for bodiless requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Original file name for upload requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default)]
    pub created_at_ms: u64,
}

/// A device's answer to a [`RequestEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: String,
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Base64 body (empty string for no body).
    #[serde(default)]
    pub body: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Identity of the responding device, checked against the request target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// Body of `POST /proxy/send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    /// Client-generated id; the relay generates one when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Informational sender identity.
    #[serde(default, alias = "from_device", skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(alias = "device_id")]
    pub to_device: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Reply to `POST /proxy/send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendAccepted {
    pub status: String,
    pub request_id: String,
}

/// Reply to `GET /proxy/poll/{device_id}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PollResponse {
    pub requests: Vec<RequestEnvelope>,
}

/// Reply to `POST /proxy/respond`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RespondAck {
    pub status: String,
    /// `false` when the response was a duplicate, late or unknown (dropped).
    pub delivered: bool,
}

fn default_content_type() -> String {
    "application/json".to_string()
}

fn default_method() -> String {
    "GET".to_string()
}

/// Fresh globally unique request id.
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Wall-clock unix milliseconds (informational timestamps only).
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Encode raw bytes for an envelope body.
pub fn encode_body(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Validate id format: alphanumeric, dash, underscore, dot, colon, 1-128 chars.
pub fn is_valid_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_ID_LEN
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

/// A bare file name: no path separators, quotes or control characters.
pub fn is_valid_filename(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= MAX_FILENAME_LEN
        && s != "."
        && s != ".."
        && !s.chars().any(|c| c.is_control() || matches!(c, '/' | '\\' | '"'))
}

/// Drop hop-by-hop headers (case-insensitive) from a header map.
pub fn strip_hop_by_hop(headers: &mut HashMap<String, String>) {
    headers.retain(|k, _| !HOP_BY_HOP.contains(&k.to_ascii_lowercase().as_str()));
}

fn decode_body(encoded: &str, max_body_bytes: usize) -> Result<Vec<u8>, RelayError> {
    let bytes = BASE64
        .decode(encoded)
        .map_err(|e| RelayError::MalformedEnvelope(format!("body is not valid base64: {e}")))?;
    if bytes.len() > max_body_bytes {
        return Err(RelayError::PayloadTooLarge {
            size: bytes.len(),
            limit: max_body_bytes,
        });
    }
    Ok(bytes)
}

impl RequestEnvelope {
    /// New bodiless envelope with a fresh request id.
    pub fn new(device_id: impl Into<String>, method: &str, path: impl Into<String>) -> Self {
        Self {
            request_id: generate_request_id(),
            device_id: device_id.into(),
            method: method.to_ascii_uppercase(),
            path: path.into(),
            headers: HashMap::new(),
            params: HashMap::new(),
            body: None,
            filename: None,
            created_at_ms: now_ms(),
        }
    }

    #[must_use]
    pub fn with_param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_filename(mut self, name: impl Into<String>) -> Self {
        self.filename = Some(name.into());
        self
    }

    pub fn with_body(mut self, bytes: &[u8]) -> Self {
        self.body = if bytes.is_empty() {
            None
        } else {
            Some(encode_body(bytes))
        };
        self
    }

    /// Reject anything that must never reach a device queue.
    pub fn validate(&self, max_body_bytes: usize) -> Result<(), RelayError> {
        if !is_valid_id(&self.request_id) {
            return Err(RelayError::MalformedEnvelope(
                "invalid request_id format".into(),
            ));
        }
        if !is_valid_id(&self.device_id) {
            return Err(RelayError::MalformedEnvelope(
                "invalid device id format".into(),
            ));
        }
        if !METHODS.contains(&self.method.as_str()) {
            return Err(RelayError::MalformedEnvelope(format!(
                "unsupported method '{}'",
                self.method
            )));
        }
        if !self.path.starts_with('/')
            || self.path.len() > MAX_PATH_LEN
            || self.path.chars().any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(RelayError::MalformedEnvelope("invalid path".into()));
        }
        if self.headers.len() > MAX_HEADERS || self.params.len() > MAX_HEADERS {
            return Err(RelayError::MalformedEnvelope(format!(
                "too many headers or params (max {MAX_HEADERS})"
            )));
        }
        if let Some(name) = &self.filename {
            if !is_valid_filename(name) {
                return Err(RelayError::MalformedEnvelope("invalid filename".into()));
            }
        }
        if let Some(body) = &self.body {
            decode_body(body, max_body_bytes)?;
        }
        Ok(())
    }

    /// Decoded body bytes (empty when absent).
    pub fn body_bytes(&self) -> Result<Vec<u8>, RelayError> {
        match &self.body {
            Some(b) => decode_body(b, usize::MAX),
            None => Ok(Vec::new()),
        }
    }
}

impl SendRequest {
    /// Normalize into an envelope, generating a request id if the client didn't.
    pub fn into_envelope(self) -> RequestEnvelope {
        RequestEnvelope {
            request_id: self.request_id.unwrap_or_else(generate_request_id),
            device_id: self.to_device,
            method: self.method.to_ascii_uppercase(),
            path: self.path,
            headers: self.headers,
            params: self.params,
            body: self.body,
            filename: self.filename,
            created_at_ms: now_ms(),
        }
    }
}

impl ResponseEnvelope {
    pub fn new(request_id: impl Into<String>, status_code: u16, body: &[u8], content_type: &str) -> Self {
        Self {
            request_id: request_id.into(),
            status_code,
            headers: HashMap::new(),
            body: encode_body(body),
            content_type: content_type.to_string(),
            device_id: None,
        }
    }

    /// Synthetic JSON error envelope (`{"error", "code"}` body).
    pub fn error(request_id: impl Into<String>, status_code: u16, code: &str, message: &str) -> Self {
        let body = json!({"error": message, "code": code}).to_string();
        Self::new(request_id, status_code, body.as_bytes(), "application/json")
    }

    pub fn validate(&self, max_body_bytes: usize) -> Result<(), RelayError> {
        if !is_valid_id(&self.request_id) {
            return Err(RelayError::MalformedEnvelope(
                "invalid request_id format".into(),
            ));
        }
        if !(100..=599).contains(&self.status_code) {
            return Err(RelayError::MalformedEnvelope(format!(
                "status_code {} out of range",
                self.status_code
            )));
        }
        if self.headers.len() > MAX_HEADERS {
            return Err(RelayError::MalformedEnvelope(format!(
                "too many headers (max {MAX_HEADERS})"
            )));
        }
        decode_body(&self.body, max_body_bytes)?;
        Ok(())
    }

    pub fn body_bytes(&self) -> Result<Vec<u8>, RelayError> {
        decode_body(&self.body, usize::MAX)
    }
}
