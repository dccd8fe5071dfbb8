//! Client side of the tunnel: send a request to a device and wait for its answer.
//!
//! [`ClientProxy::send_command`] posts the request to `/proxy/send` under a
//! client-generated id, then parks on `/proxy/await/{id}` until the device's
//! response comes back or the timeout elapses. Timing out only cancels the
//! local wait: the device may still execute the request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use burrow::envelope::{encode_body, SendRequest};
use burrow::{ClientError, DeviceRecord, RelayClient, ResponseEnvelope};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

/// Extra time given to the await call on top of the relay-side wait, so the
/// relay's 504 normally arrives before the local timer fires.
const AWAIT_GRACE: Duration = Duration::from_secs(2);

/// A request to run on a device.
#[derive(Debug, Clone, Default)]
pub struct CommandRequest {
    pub method: String,
    pub path: String,
    pub params: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl CommandRequest {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_ascii_uppercase(),
            path: path.to_string(),
            ..Self::default()
        }
    }

    pub fn get(path: &str) -> Self {
        Self::new("GET", path)
    }

    #[must_use]
    pub fn param(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// A device's response, body already decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub request_id: String,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl ProxyResponse {
    fn from_envelope(envelope: ResponseEnvelope) -> Result<Self, ProxyError> {
        let body = envelope
            .body_bytes()
            .map_err(|e| ProxyError::Protocol(format!("Undecodable response body: {e}")))?;
        Ok(Self {
            request_id: envelope.request_id,
            status_code: envelope.status_code,
            headers: envelope.headers,
            content_type: envelope.content_type,
            body,
        })
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Body as text, lossily decoded.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ProxyError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| ProxyError::Protocol(format!("Response body is not the expected JSON: {e}")))
    }
}

/// Why a command produced no device response.
#[derive(Debug)]
pub enum ProxyError {
    /// No response within the caller's timeout.
    Timeout(Duration),
    /// The relay couldn't be reached.
    Transport(reqwest::Error),
    /// The relay rejected the call.
    Relay {
        status: u16,
        code: String,
        message: String,
    },
    /// Bad relay URL or an unexpected payload.
    Protocol(String),
}

impl ProxyError {
    /// Relay error code (`DEVICE_NOT_FOUND`, `QUEUE_FULL`, ...), if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Relay { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<ClientError> for ProxyError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::Request(e) => Self::Transport(e),
            ClientError::Relay {
                status,
                code,
                message,
            } => Self::Relay {
                status,
                code,
                message,
            },
            ClientError::Protocol(msg) => Self::Protocol(msg),
        }
    }
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(d) => write!(f, "No response from device within {}ms", d.as_millis()),
            Self::Transport(e) => write!(f, "Relay unreachable: {e}"),
            Self::Relay {
                status,
                code,
                message,
            } => write!(f, "Relay error (HTTP {status} {code}): {message}"),
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// An outstanding [`ClientProxy::send_command`] call.
#[derive(Debug, Clone)]
pub struct PendingCall {
    pub device_id: String,
    pub method: String,
    pub path: String,
    pub started: Instant,
}

type PendingTable = Arc<Mutex<HashMap<String, PendingCall>>>;

/// Removes its entry from the pending table however the call ends.
struct PendingGuard {
    table: PendingTable,
    request_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.request_id);
    }
}

/// Sends commands to devices through one relay. Cheap to clone; clones share
/// the pending-call table.
#[derive(Clone)]
pub struct ClientProxy {
    relay: RelayClient,
    from: Option<String>,
    pending: PendingTable,
}

impl ClientProxy {
    pub fn new(relay_url: &str, relay_key: Option<String>) -> Result<Self, ProxyError> {
        Ok(Self {
            relay: RelayClient::new(relay_url, relay_key)?,
            from: None,
            pending: Arc::default(),
        })
    }

    /// Identify this client in relay logs (`from` on `/proxy/send`).
    #[must_use]
    pub fn with_sender(mut self, from: &str) -> Self {
        self.from = Some(from.to_string());
        self
    }

    pub fn relay_url(&self) -> &str {
        self.relay.base_url()
    }

    /// Run `command` on `device_id` and wait up to `timeout` for the answer.
    pub async fn send_command(
        &self,
        device_id: &str,
        command: CommandRequest,
        timeout: Duration,
    ) -> Result<ProxyResponse, ProxyError> {
        let deadline = Instant::now() + timeout;
        let request_id = Uuid::new_v4().to_string();
        let _guard = self.track(&request_id, device_id, &command);

        let req = SendRequest {
            request_id: Some(request_id.clone()),
            from: self.from.clone(),
            to_device: device_id.to_string(),
            method: command.method,
            path: command.path,
            headers: command.headers,
            params: command.params,
            body: command.body.as_deref().map(encode_body),
            filename: None,
        };
        self.relay.send(&req).await?;
        debug!(request_id = %request_id, device_id = %device_id, "Command queued");

        // The relay caps each await at `relay.max_await_ms` and keeps the
        // request outstanding when it does, so wait again until our deadline.
        let mut resumed = false;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.abandon(&request_id).await;
                return Err(ProxyError::Timeout(timeout));
            }

            let waited = tokio::time::timeout(
                remaining + AWAIT_GRACE,
                self.relay.await_response(&request_id, remaining),
            )
            .await;
            match waited {
                Ok(Ok(envelope)) => return ProxyResponse::from_envelope(envelope),
                Ok(Err(e)) if e.is_timeout() => {
                    debug!(request_id = %request_id, "Relay await window ended, waiting again");
                    resumed = true;
                }
                // The relay forgot it after a final 504; that is our timeout too.
                Ok(Err(e)) if resumed && e.is_not_found() => {
                    return Err(ProxyError::Timeout(timeout));
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    self.abandon(&request_id).await;
                    return Err(ProxyError::Timeout(timeout));
                }
            }
        }
    }

    /// Devices registered under `email`.
    pub async fn list_devices(&self, email: &str) -> Result<Vec<DeviceRecord>, ProxyError> {
        Ok(self.relay.list_devices(Some(email)).await?)
    }

    pub async fn list_all_devices(&self) -> Result<Vec<DeviceRecord>, ProxyError> {
        Ok(self.relay.list_devices(None).await?)
    }

    /// The relay's `/health` document.
    pub async fn health(&self) -> Result<Value, ProxyError> {
        Ok(self.relay.health().await?)
    }

    /// Number of calls currently waiting on a device.
    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Snapshot of the outstanding calls, keyed by request id.
    pub fn pending(&self) -> HashMap<String, PendingCall> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn track(&self, request_id: &str, device_id: &str, command: &CommandRequest) -> PendingGuard {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                request_id.to_string(),
                PendingCall {
                    device_id: device_id.to_string(),
                    method: command.method.clone(),
                    path: command.path.clone(),
                    started: Instant::now(),
                },
            );
        PendingGuard {
            table: self.pending.clone(),
            request_id: request_id.to_string(),
        }
    }

    /// Best-effort cancel. The relay may already have dropped the entry.
    async fn abandon(&self, request_id: &str) {
        match self.relay.abandon(request_id).await {
            Ok(()) => debug!(request_id = %request_id, "Abandoned timed-out request"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(request_id = %request_id, "Failed to abandon request: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use burrow::config::{AgentConfig, Config};
    use burrow::tunnel::agent::AgentHandle;
    use burrow::tunnel::executor::{ExecutionError, LocalExecutor};
    use burrow::tunnel::relay;
    use burrow::{AgentState, DeviceAgent, RelayState, RequestEnvelope};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use super::*;

    /// Stands in for the device's local HTTP server.
    struct FilesExecutor;

    impl LocalExecutor for FilesExecutor {
        async fn execute(
            &self,
            request: &RequestEnvelope,
        ) -> Result<ResponseEnvelope, ExecutionError> {
            match request.path.as_str() {
                "/api/files" => {
                    let dir = request.params.get("path").cloned().unwrap_or_default();
                    let body = json!({
                        "path": dir,
                        "files": [{"name": "DCIM", "is_dir": true}, {"name": "notes.txt", "is_dir": false}],
                    });
                    Ok(ResponseEnvelope::new(
                        &request.request_id,
                        200,
                        body.to_string().as_bytes(),
                        "application/json",
                    ))
                }
                "/slow" => {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    Ok(ResponseEnvelope::new(&request.request_id, 200, b"done", "text/plain"))
                }
                "/echo" => {
                    let body = request
                        .body_bytes()
                        .map_err(|e| ExecutionError::InvalidRequest(e.to_string()))?;
                    let mut resp =
                        ResponseEnvelope::new(&request.request_id, 201, &body, "application/octet-stream");
                    if let Some(v) = request.headers.get("x-tag") {
                        resp.headers.insert("x-tag".into(), v.clone());
                    }
                    Ok(resp)
                }
                _ => Ok(ResponseEnvelope::error(
                    &request.request_id,
                    404,
                    "NOT_FOUND",
                    "no such route",
                )),
            }
        }
    }

    async fn spawn_relay(config: Config) -> (String, oneshot::Sender<()>) {
        let state = RelayState::new(config);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = relay::serve(listener, state, async move {
                let _ = shutdown_rx.await;
            })
            .await;
        });
        (format!("http://{addr}"), shutdown_tx)
    }

    async fn spawn_device(relay_url: &str) -> AgentHandle {
        let mut config = AgentConfig::new(relay_url, "D1", "owner@x.io");
        config.device_name = "Pixel".into();
        config.poll_wait_ms = 500;
        config.shutdown_grace_secs = 1;
        let handle = DeviceAgent::new(config, None, FilesExecutor).unwrap().spawn();
        let mut rx = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == AgentState::Polling))
            .await
            .expect("agent never started polling")
            .unwrap();
        handle
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lists_files_on_a_registered_device() {
        let (url, _shutdown) = spawn_relay(Config::default()).await;
        let device = spawn_device(&url).await;
        let proxy = ClientProxy::new(&url, None).unwrap().with_sender("desk");

        let resp = proxy
            .send_command(
                "D1",
                CommandRequest::get("/api/files").param("path", "/sdcard"),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.content_type, "application/json");
        let listing: Value = resp.json().unwrap();
        assert_eq!(listing["path"], "/sdcard");
        assert_eq!(listing["files"].as_array().unwrap().len(), 2);
        assert_eq!(proxy.pending_count(), 0);

        device.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn body_and_headers_round_trip() {
        let (url, _shutdown) = spawn_relay(Config::default()).await;
        let device = spawn_device(&url).await;
        let proxy = ClientProxy::new(&url, None).unwrap();

        let resp = proxy
            .send_command(
                "D1",
                CommandRequest::new("post", "/echo")
                    .header("x-tag", "t1")
                    .body(&b"\x00\xffbinary"[..]),
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(resp.status_code, 201);
        assert_eq!(resp.body, b"\x00\xffbinary");
        assert_eq!(resp.headers.get("x-tag").map(String::as_str), Some("t1"));

        let missing = proxy
            .send_command("D1", CommandRequest::get("/nope"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(missing.status_code, 404);
        assert!(!missing.is_success());

        device.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn never_registered_device_times_out_without_leaks() {
        let mut config = Config::default();
        config.relay.reject_unknown_devices = false;
        let (url, _shutdown) = spawn_relay(config).await;
        let proxy = ClientProxy::new(&url, None).unwrap();

        let started = Instant::now();
        let err = proxy
            .send_command("ghost", CommandRequest::get("/api/files"), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Timeout(d) if d == Duration::from_millis(300)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(proxy.pending_count(), 0);

        let health = proxy.health().await.unwrap();
        assert_eq!(health["mailbox"]["outstanding"], 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_device_is_rejected_by_default() {
        let (url, _shutdown) = spawn_relay(Config::default()).await;
        let proxy = ClientProxy::new(&url, None).unwrap();

        let err = proxy
            .send_command("ghost", CommandRequest::get("/"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("DEVICE_NOT_FOUND"));
        assert!(matches!(err, ProxyError::Relay { status: 404, .. }));
        assert_eq!(proxy.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pending_table_tracks_in_flight_calls() {
        let (url, _shutdown) = spawn_relay(Config::default()).await;
        let device = spawn_device(&url).await;
        let proxy = ClientProxy::new(&url, None).unwrap();

        let call = {
            let proxy = proxy.clone();
            tokio::spawn(async move {
                proxy
                    .send_command("D1", CommandRequest::get("/slow"), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::timeout(Duration::from_secs(2), async {
            while proxy.pending_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        let pending = proxy.pending();
        let only = pending.values().next().unwrap();
        assert_eq!(only.device_id, "D1");
        assert_eq!(only.path, "/slow");

        let resp = call.await.unwrap().unwrap();
        assert_eq!(resp.text(), "done");
        assert_eq!(proxy.pending_count(), 0);

        device.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn waits_past_the_relay_await_ceiling() {
        let mut config = Config::default();
        config.relay.max_await_ms = 100;
        let (url, _shutdown) = spawn_relay(config).await;
        let device = spawn_device(&url).await;
        let proxy = ClientProxy::new(&url, None).unwrap();

        let resp = proxy
            .send_command("D1", CommandRequest::get("/slow"), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(resp.text(), "done");
        assert_eq!(proxy.pending_count(), 0);

        device.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deadline_still_bounds_resumed_waits() {
        let mut config = Config::default();
        config.relay.max_await_ms = 100;
        config.relay.reject_unknown_devices = false;
        let (url, _shutdown) = spawn_relay(config).await;
        let proxy = ClientProxy::new(&url, None).unwrap();

        let started = Instant::now();
        let err = proxy
            .send_command("ghost", CommandRequest::get("/"), Duration::from_millis(450))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Timeout(_)));
        assert!(started.elapsed() >= Duration::from_millis(450));
        assert!(started.elapsed() < Duration::from_secs(5));

        let health = proxy.health().await.unwrap();
        assert_eq!(health["mailbox"]["outstanding"], 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn lists_devices_by_owner() {
        let (url, _shutdown) = spawn_relay(Config::default()).await;
        let device = spawn_device(&url).await;
        let proxy = ClientProxy::new(&url, None).unwrap();

        let mine = proxy.list_devices("owner@x.io").await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].device_id, "D1");
        assert!(mine[0].online);
        assert!(proxy.list_devices("other@x.io").await.unwrap().is_empty());
        assert_eq!(proxy.list_all_devices().await.unwrap().len(), 1);

        device.stop().await;
    }

    #[tokio::test]
    async fn unreachable_relay_is_a_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let proxy = ClientProxy::new(&format!("http://{addr}"), None).unwrap();
        let err = proxy
            .send_command("D1", CommandRequest::get("/"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Transport(_)));
        assert_eq!(proxy.pending_count(), 0);
    }
}
