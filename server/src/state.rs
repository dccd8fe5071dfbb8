//! Shared relay state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::mailbox::Mailbox;
use crate::registry::Registry;

/// Shared application state for the burrow relay.
#[derive(Clone)]
pub struct RelayState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the relay started (for uptime calculation).
    pub start_time: Instant,
    /// Who is registered and whether they are live.
    pub registry: Registry,
    /// Per-device queues and the request/response correlation table.
    pub mailbox: Mailbox,
}

impl RelayState {
    pub fn new(config: Config) -> Self {
        let registry = Registry::new(Duration::from_secs(config.relay.liveness_window_secs));
        let mailbox = Mailbox::new(config.relay.max_queued_per_device);
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            registry,
            mailbox,
        }
    }

    /// Clamp a device-requested long-poll wait to the configured ceiling.
    pub fn poll_wait(&self, requested_ms: Option<u64>) -> Duration {
        let relay = &self.config.relay;
        let ms = requested_ms
            .unwrap_or(relay.default_poll_wait_ms)
            .min(relay.max_poll_wait_ms);
        Duration::from_millis(ms)
    }

    /// Clamp a client-requested await timeout to the configured ceiling.
    /// The flag is set when the ceiling cut the request short.
    pub fn await_timeout(&self, requested_ms: Option<u64>) -> (Duration, bool) {
        let relay = &self.config.relay;
        let requested = requested_ms.unwrap_or(relay.proxy_timeout_secs * 1000);
        let ms = requested.min(relay.max_await_ms);
        (Duration::from_millis(ms), ms < requested)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.config.relay.proxy_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.config.relay.upload_timeout_secs)
    }

    pub fn max_body_bytes(&self) -> usize {
        self.config.server.max_body_bytes
    }
}
