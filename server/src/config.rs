//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `BURROW_LISTEN`, `BURROW_RELAY_KEY`,
//!    `BURROW_RELAY_URL`, `BURROW_DEVICE_ID`, `BURROW_EMAIL`
//! 2. **Config file** — path via `--config <path>`, or `burrow.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8787"
//! max_body_bytes = 16777216        # 16 MB decoded envelope body
//! max_concurrent_requests = 10000  # includes parked long-polls
//!
//! [auth]
//! relay_key = "shared-secret"      # optional; omit for an open relay
//!
//! [logging]
//! level = "info"
//!
//! [relay]
//! liveness_window_secs = 60
//! dispatch_ttl_secs = 60
//! sweep_interval_secs = 10
//! default_poll_wait_ms = 20000
//! max_poll_wait_ms = 25000
//! max_await_ms = 120000
//! proxy_timeout_secs = 30
//! upload_timeout_secs = 60
//! max_queued_per_device = 256
//! reject_unknown_devices = true
//!
//! # Only needed for `burrow agent`
//! [agent]
//! relay_url = "https://relay.example.com"
//! device_id = "pixel-7-a1b2"
//! email = "owner@example.com"
//! device_name = "Pixel 7"
//! local_port = 8080
//! heartbeat_interval_secs = 20
//! poll_wait_ms = 20000
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    /// Device agent settings; required by `burrow agent`.
    pub agent: Option<AgentConfig>,
}

/// HTTP listener and resource limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8787`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Largest decoded envelope body in bytes (default 16 MB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Cap on in-flight HTTP requests, long-polls included (default 10 000).
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
}

/// Authentication settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared Bearer token required on every endpoint except `/health`.
    /// Override with `BURROW_RELAY_KEY`. `None` leaves the relay open.
    #[serde(default)]
    pub relay_key: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Relay-side timing and capacity knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Seconds of silence before a device reads as offline (default 60).
    #[serde(default = "default_liveness_window")]
    pub liveness_window_secs: u64,
    /// Seconds an unclaimed request may sit queued or dispatched (default 60).
    #[serde(default = "default_dispatch_ttl")]
    pub dispatch_ttl_secs: u64,
    /// Seconds between expiry sweeps (default 10).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Long-poll wait when the device doesn't ask for one (default 20 000 ms).
    #[serde(default = "default_poll_wait")]
    pub default_poll_wait_ms: u64,
    /// Upper clamp for a device-requested long-poll wait (default 25 000 ms).
    #[serde(default = "default_max_poll_wait")]
    pub max_poll_wait_ms: u64,
    /// Upper clamp for `GET /proxy/await` timeouts (default 120 000 ms).
    #[serde(default = "default_max_await")]
    pub max_await_ms: u64,
    /// Timeout for the transparent `/d/{device_id}/*` proxy (default 30 s).
    #[serde(default = "default_proxy_timeout")]
    pub proxy_timeout_secs: u64,
    /// Timeout for `POST /proxy/{device_id}/upload` (default 60 s).
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,
    /// Queue capacity per device (default 256).
    #[serde(default = "default_max_queued")]
    pub max_queued_per_device: usize,
    /// Refuse `/proxy/send` to devices that never registered (default true).
    #[serde(default = "default_true")]
    pub reject_unknown_devices: bool,
}

/// Device agent settings (`burrow agent`).
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Relay base URL, e.g. `https://relay.example.com`. Override with `BURROW_RELAY_URL`.
    pub relay_url: String,
    /// Stable device id. Override with `BURROW_DEVICE_ID`.
    pub device_id: String,
    /// Owner identity. Override with `BURROW_EMAIL`.
    pub email: String,
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Address advertised to the relay (informational).
    #[serde(default)]
    pub local_ip: Option<String>,
    /// Port of the local HTTP server on 127.0.0.1 (default 8080).
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Seconds between heartbeats (default 20). Keep below the relay's liveness window.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Long-poll wait requested from the relay (default 20 000 ms).
    #[serde(default = "default_poll_wait")]
    pub poll_wait_ms: u64,
    /// Initial retry delay after a failed register or poll (default 1 s).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Retry delay ceiling (default 30 s).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// Timeout for one forwarded request against the local server (default 30 s).
    #[serde(default = "default_local_timeout")]
    pub local_timeout_secs: u64,
    /// Grace period for in-flight requests on stop (default 5 s).
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_listen() -> String {
    "0.0.0.0:8787".to_string()
}
fn default_max_body_bytes() -> usize {
    16 * 1024 * 1024 // 16 MB
}
fn default_max_concurrent_requests() -> usize {
    10_000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_liveness_window() -> u64 {
    60
}
fn default_dispatch_ttl() -> u64 {
    60
}
fn default_sweep_interval() -> u64 {
    10
}
fn default_poll_wait() -> u64 {
    20_000
}
fn default_max_poll_wait() -> u64 {
    25_000
}
fn default_max_await() -> u64 {
    120_000
}
fn default_proxy_timeout() -> u64 {
    30
}
fn default_upload_timeout() -> u64 {
    60
}
fn default_max_queued() -> usize {
    256
}
fn default_true() -> bool {
    true
}
fn default_device_name() -> String {
    "burrow device".to_string()
}
fn default_local_port() -> u16 {
    8080
}
fn default_heartbeat_interval() -> u64 {
    20
}
fn default_reconnect_delay() -> u64 {
    1
}
fn default_reconnect_max_delay() -> u64 {
    30
}
fn default_local_timeout() -> u64 {
    30
}
fn default_shutdown_grace() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_body_bytes: default_max_body_bytes(),
            max_concurrent_requests: default_max_concurrent_requests(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            liveness_window_secs: default_liveness_window(),
            dispatch_ttl_secs: default_dispatch_ttl(),
            sweep_interval_secs: default_sweep_interval(),
            default_poll_wait_ms: default_poll_wait(),
            max_poll_wait_ms: default_max_poll_wait(),
            max_await_ms: default_max_await(),
            proxy_timeout_secs: default_proxy_timeout(),
            upload_timeout_secs: default_upload_timeout(),
            max_queued_per_device: default_max_queued(),
            reject_unknown_devices: default_true(),
        }
    }
}

impl AgentConfig {
    /// Agent settings with defaults for everything but identity and relay.
    pub fn new(relay_url: &str, device_id: &str, email: &str) -> Self {
        Self {
            relay_url: relay_url.to_string(),
            device_id: device_id.to_string(),
            email: email.to_string(),
            device_name: default_device_name(),
            local_ip: None,
            local_port: default_local_port(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            poll_wait_ms: default_poll_wait(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            local_timeout_secs: default_local_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise looks for
    /// `burrow.toml` in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = match path {
            Some(p) => Self::from_file(Path::new(p))?,
            None if Path::new("burrow.toml").exists() => {
                Self::from_file(Path::new("burrow.toml"))?
            }
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {e}", path.display()))?;
        toml::from_str(&content)
            .map_err(|e| format!("Failed to parse config file {}: {e}", path.display()))
    }

    /// Apply `BURROW_*` overrides from an env lookup.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = var("BURROW_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(key) = var("BURROW_RELAY_KEY") {
            self.auth.relay_key = Some(key).filter(|k| !k.is_empty());
        }
        if let Some(agent) = self.agent.as_mut() {
            if let Some(url) = var("BURROW_RELAY_URL") {
                agent.relay_url = url;
            }
            if let Some(id) = var("BURROW_DEVICE_ID") {
                agent.device_id = id;
            }
            if let Some(email) = var("BURROW_EMAIL") {
                agent.email = email;
            }
        } else if let (Some(url), Some(id), Some(email)) = (
            var("BURROW_RELAY_URL"),
            var("BURROW_DEVICE_ID"),
            var("BURROW_EMAIL"),
        ) {
            self.agent = Some(AgentConfig::new(&url, &id, &email));
        }
    }
}
