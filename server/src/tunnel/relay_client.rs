//! HTTP client for the relay's REST endpoints.
//!
//! [`RelayClient`] wraps `reqwest::Client` with one typed method per relay
//! endpoint. The device agent uses the device half (register, heartbeat, poll,
//! respond); client proxies use the other half (send, await, abandon, devices).
//!
//! ## Authentication
//!
//! When a relay key is configured, every call except [`RelayClient::health`]
//! carries it as a Bearer token.
//!
//! ## Error handling
//!
//! Non-2xx responses are parsed for the relay's `{"error", "code"}` body. If
//! parsing fails, the raw response body is returned as the error message.

use std::time::Duration;

use reqwest::{RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::envelope::{
    PollResponse, RespondAck, RequestEnvelope, ResponseEnvelope, SendAccepted, SendRequest,
};
use crate::registry::{DeviceRecord, RegisterRequest};

/// Timeout for the short control calls (register, heartbeat, respond, ...).
const CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Slack added on top of a long-poll or await so the relay times out first.
const LONG_POLL_SLACK: Duration = Duration::from_secs(10);

/// HTTP client for one relay.
#[derive(Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    base_url: Url,
    relay_key: Option<String>,
}

#[derive(Deserialize)]
struct DeviceList {
    devices: Vec<DeviceRecord>,
}

impl RelayClient {
    /// Create a client for the relay at `base_url`.
    pub fn new(base_url: &str, relay_key: Option<String>) -> Result<Self, ClientError> {
        // Strip trailing slash for consistent URL construction
        let base_url = Url::parse(base_url.trim_end_matches('/'))
            .map_err(|e| ClientError::Protocol(format!("Invalid relay URL: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::Protocol(format!(
                "Invalid relay URL: {base_url}"
            )));
        }
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(ClientError::Request)?;
        Ok(Self {
            http,
            base_url,
            relay_key,
        })
    }

    /// The relay's base URL.
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// `GET /health` — liveness check (no auth required).
    pub async fn health(&self) -> Result<Value, ClientError> {
        let resp = self
            .http
            .get(self.url(&["health"])?)
            .timeout(CALL_TIMEOUT)
            .send()
            .await
            .map_err(ClientError::Request)?;
        Self::handle_response(resp).await
    }

    /// `POST /register` — insert or refresh this device's record.
    pub async fn register(&self, req: &RegisterRequest) -> Result<(), ClientError> {
        let builder = self.http.post(self.url(&["register"])?).json(req);
        self.call::<Value>(builder, CALL_TIMEOUT).await.map(drop)
    }

    /// `POST /heartbeat/{device_id}` — refresh liveness, optionally moving the address.
    pub async fn heartbeat(
        &self,
        device_id: &str,
        local_ip: Option<&str>,
        port: Option<u16>,
    ) -> Result<(), ClientError> {
        let mut body = json!({});
        if let Some(ip) = local_ip {
            body["local_ip"] = json!(ip);
        }
        if let Some(p) = port {
            body["port"] = json!(p);
        }
        let builder = self
            .http
            .post(self.url(&["heartbeat", device_id])?)
            .json(&body);
        self.call::<Value>(builder, CALL_TIMEOUT).await.map(drop)
    }

    /// `DELETE /unregister/{device_id}` — go offline now.
    pub async fn unregister(&self, device_id: &str) -> Result<(), ClientError> {
        let builder = self.http.delete(self.url(&["unregister", device_id])?);
        self.call::<Value>(builder, CALL_TIMEOUT).await.map(drop)
    }

    /// `GET /proxy/poll/{device_id}?wait_ms=` — long-poll for queued requests.
    pub async fn poll(
        &self,
        device_id: &str,
        wait: Duration,
    ) -> Result<Vec<RequestEnvelope>, ClientError> {
        let mut url = self.url(&["proxy", "poll", device_id])?;
        url.query_pairs_mut()
            .append_pair("wait_ms", &wait.as_millis().to_string());
        let builder = self.http.get(url);
        let polled: PollResponse = self.call(builder, wait + LONG_POLL_SLACK).await?;
        Ok(polled.requests)
    }

    /// `POST /proxy/respond` — deliver a response envelope.
    pub async fn respond(&self, response: &ResponseEnvelope) -> Result<RespondAck, ClientError> {
        let builder = self
            .http
            .post(self.url(&["proxy", "respond"])?)
            .json(response);
        self.call(builder, CALL_TIMEOUT).await
    }

    /// `POST /proxy/send` — enqueue a request for a device.
    pub async fn send(&self, req: &SendRequest) -> Result<SendAccepted, ClientError> {
        let builder = self.http.post(self.url(&["proxy", "send"])?).json(req);
        self.call(builder, CALL_TIMEOUT).await
    }

    /// `GET /proxy/await/{request_id}?timeout_ms=` — wait for the correlated response.
    pub async fn await_response(
        &self,
        request_id: &str,
        timeout: Duration,
    ) -> Result<ResponseEnvelope, ClientError> {
        let mut url = self.url(&["proxy", "await", request_id])?;
        url.query_pairs_mut()
            .append_pair("timeout_ms", &timeout.as_millis().to_string());
        let builder = self.http.get(url);
        self.call(builder, timeout + LONG_POLL_SLACK).await
    }

    /// `DELETE /proxy/requests/{request_id}` — best-effort cancel.
    pub async fn abandon(&self, request_id: &str) -> Result<(), ClientError> {
        let builder = self
            .http
            .delete(self.url(&["proxy", "requests", request_id])?);
        self.call::<Value>(builder, CALL_TIMEOUT).await.map(drop)
    }

    /// `GET /devices` or `GET /devices/{email}`.
    pub async fn list_devices(&self, email: Option<&str>) -> Result<Vec<DeviceRecord>, ClientError> {
        let url = match email {
            Some(e) => self.url(&["devices", e])?,
            None => self.url(&["devices"])?,
        };
        let list: DeviceList = self.call(self.http.get(url), CALL_TIMEOUT).await?;
        Ok(list.devices)
    }

    /// Base URL plus percent-encoded path segments.
    fn url(&self, segments: &[&str]) -> Result<Url, ClientError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| ClientError::Protocol("Relay URL cannot carry a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        timeout: Duration,
    ) -> Result<T, ClientError> {
        let builder = match &self.relay_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        };
        let resp = builder
            .timeout(timeout)
            .send()
            .await
            .map_err(ClientError::Request)?;
        Self::handle_response(resp).await
    }

    async fn handle_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ClientError> {
        let status = resp.status();
        let body = resp.text().await.map_err(ClientError::Request)?;

        if status.is_success() {
            serde_json::from_str(&body)
                .map_err(|e| ClientError::Protocol(format!("Invalid JSON from relay: {e}")))
        } else {
            let parsed = serde_json::from_str::<Value>(&body).ok();
            let code = parsed
                .as_ref()
                .and_then(|v| v["code"].as_str().map(String::from))
                .unwrap_or_default();
            let message = parsed
                .as_ref()
                .and_then(|v| v["error"].as_str().map(String::from))
                .unwrap_or(body);
            Err(ClientError::Relay {
                status: status.as_u16(),
                code,
                message,
            })
        }
    }
}

/// Errors returned by [`RelayClient`] methods.
#[derive(Debug)]
pub enum ClientError {
    /// HTTP transport error (connection refused, timeout, DNS failure, etc.).
    Request(reqwest::Error),
    /// The relay returned a non-2xx HTTP status.
    Relay {
        status: u16,
        code: String,
        message: String,
    },
    /// Bad URL or a response body that isn't the expected JSON.
    Protocol(String),
}

impl ClientError {
    /// HTTP status of a relay-side rejection, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Relay { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns `true` if the error is an HTTP 404 Not Found response.
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Returns `true` if the relay gave up waiting (`504`) or the HTTP call timed out.
    pub fn is_timeout(&self) -> bool {
        match self {
            ClientError::Request(e) => e.is_timeout(),
            ClientError::Relay { status, .. } => *status == 504,
            ClientError::Protocol(_) => false,
        }
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Request(e) => write!(f, "HTTP request failed: {e}"),
            ClientError::Relay {
                status,
                code,
                message,
            } => write!(f, "Relay error (HTTP {status} {code}): {message}"),
            ClientError::Protocol(msg) => write!(f, "Protocol error: {msg}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Request(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use super::*;
    use crate::config::Config;
    use crate::tunnel::relay;
    use crate::RelayState;

    async fn spawn_relay(config: Config) -> (String, RelayState, oneshot::Sender<()>) {
        let state = RelayState::new(config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let serve_state = state.clone();
        tokio::spawn(async move {
            let _ = relay::serve(listener, serve_state, async move {
                let _ = shutdown_rx.await;
            })
            .await;
        });
        (format!("http://{addr}"), state, shutdown_tx)
    }

    fn registration(id: &str) -> RegisterRequest {
        RegisterRequest {
            device_id: id.into(),
            email: "owner@x.io".into(),
            device_name: "Pixel".into(),
            local_ip: None,
            port: 8080,
        }
    }

    #[test]
    fn segments_are_percent_encoded() {
        let client = RelayClient::new("http://relay.local:8787/", None).unwrap();
        let url = client.url(&["devices", "a b/c@x.io"]).unwrap();
        assert_eq!(url.as_str(), "http://relay.local:8787/devices/a%20b%2Fc@x.io");
    }

    #[test]
    fn timeouts_are_recognized() {
        let err = ClientError::Relay {
            status: 504,
            code: "TIMEOUT".into(),
            message: "late".into(),
        };
        assert!(err.is_timeout());
        assert!(!err.is_not_found());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn device_and_client_halves_meet_over_http() {
        let (url, _state, shutdown) = spawn_relay(Config::default()).await;
        let device = RelayClient::new(&url, None).unwrap();
        let caller = RelayClient::new(&url, None).unwrap();

        device.register(&registration("D1")).await.unwrap();
        device.heartbeat("D1", Some("10.0.0.2"), None).await.unwrap();
        let listed = caller.list_devices(Some("owner@x.io")).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].local_ip.as_deref(), Some("10.0.0.2"));

        let env = RequestEnvelope::new("D1", "GET", "/api/ping");
        let accepted = caller
            .send(&SendRequest {
                request_id: Some(env.request_id.clone()),
                from: Some("desk".into()),
                to_device: "D1".into(),
                method: env.method.clone(),
                path: env.path.clone(),
                headers: env.headers.clone(),
                params: env.params.clone(),
                body: None,
                filename: None,
            })
            .await
            .unwrap();
        assert_eq!(accepted.request_id, env.request_id);

        let work = device.poll("D1", Duration::from_secs(2)).await.unwrap();
        assert_eq!(work.len(), 1);
        let mut answer = ResponseEnvelope::new(&work[0].request_id, 200, b"pong", "text/plain");
        answer.device_id = Some("D1".into());
        let ack = device.respond(&answer).await.unwrap();
        assert!(ack.delivered);

        let answer = caller
            .await_response(&accepted.request_id, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(answer.body_bytes().unwrap(), b"pong");

        let err = device.heartbeat("ghost", None, None).await.unwrap_err();
        assert!(err.is_not_found());
        let _ = shutdown.send(());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn relay_key_is_sent_as_bearer() {
        let mut config = Config::default();
        config.auth.relay_key = Some("k".into());
        let (url, _state, shutdown) = spawn_relay(config).await;

        let anonymous = RelayClient::new(&url, None).unwrap();
        assert_eq!(anonymous.list_devices(None).await.unwrap_err().status(), Some(401));
        assert!(anonymous.health().await.is_ok());

        let keyed = RelayClient::new(&url, Some("k".into())).unwrap();
        keyed.register(&registration("D1")).await.unwrap();
        assert_eq!(keyed.list_devices(None).await.unwrap().len(), 1);
        let _ = shutdown.send(());
    }
}
