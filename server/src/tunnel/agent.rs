//! Device agent, the device's outbound side of the tunnel.
//!
//! Spawned by `burrow agent`. Registers with the relay, keeps the record alive
//! with heartbeats, long-polls for relayed requests and runs each one through
//! a [`LocalExecutor`] in its own task. Every request is answered exactly once:
//! local failures become a synthetic 500 envelope.
//!
//! Lifecycle (published on a `watch` channel):
//!
//! ```text
//! Unregistered → Registering → Polling ⇄ Executing → … → Stopped
//!        ↑______________|  (register failed, backoff)
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use super::executor::LocalExecutor;
use super::relay_client::{ClientError, RelayClient};
use crate::config::AgentConfig;
use crate::envelope::{is_valid_id, RequestEnvelope, ResponseEnvelope};
use crate::registry::RegisterRequest;

/// Attempts to post one response before giving up on it.
const RESPOND_ATTEMPTS: u32 = 3;
/// Bound on the best-effort unregister during stop.
const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(3);

/// Where the agent currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum AgentState {
    Unregistered = 0,
    Registering = 1,
    Polling = 2,
    /// Polling, with at least one request in flight.
    Executing = 3,
    Stopped = 4,
}

impl AgentState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Unregistered,
            1 => Self::Registering,
            2 => Self::Polling,
            3 => Self::Executing,
            _ => Self::Stopped,
        }
    }
}

/// Errors from building an agent.
#[derive(Debug)]
pub enum AgentError {
    /// The agent section of the config is unusable.
    InvalidConfig(String),
    /// The relay client couldn't be built.
    Client(ClientError),
}

impl std::fmt::Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "Invalid agent config: {msg}"),
            Self::Client(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AgentError {}

/// Lifetime counters, shared with the running task.
#[derive(Debug, Default)]
pub struct AgentStats {
    pub served: AtomicU64,
    pub failed: AtomicU64,
    pub reconnects: AtomicU64,
}

/// Point-in-time copy of [`AgentStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AgentStatsSnapshot {
    pub served: u64,
    pub failed: u64,
    pub reconnects: u64,
}

impl AgentStats {
    pub fn snapshot(&self) -> AgentStatsSnapshot {
        AgentStatsSnapshot {
            served: self.served.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

/// Publishes [`AgentState`]. `Executing` is derived from the in-flight count
/// whenever the loop itself is in `Polling`.
struct Status {
    tx: watch::Sender<AgentState>,
    phase: AtomicU8,
    in_flight: AtomicUsize,
}

impl Status {
    fn new() -> (Arc<Self>, watch::Receiver<AgentState>) {
        let (tx, rx) = watch::channel(AgentState::Unregistered);
        let status = Arc::new(Self {
            tx,
            phase: AtomicU8::new(AgentState::Unregistered as u8),
            in_flight: AtomicUsize::new(0),
        });
        (status, rx)
    }

    fn set_phase(&self, phase: AgentState) {
        self.phase.store(phase as u8, Ordering::SeqCst);
        self.publish();
    }

    fn publish(&self) {
        let phase = AgentState::from_u8(self.phase.load(Ordering::SeqCst));
        let state = if phase == AgentState::Polling && self.in_flight.load(Ordering::SeqCst) > 0 {
            AgentState::Executing
        } else {
            phase
        };
        self.tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn begin(self: &Arc<Self>) -> InFlight {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.publish();
        InFlight(self.clone())
    }
}

/// Decrements the in-flight count on drop, including when a task is aborted.
struct InFlight(Arc<Status>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0.publish();
    }
}

/// A configured agent. [`DeviceAgent::spawn`] may be called again after the
/// previous handle was stopped.
pub struct DeviceAgent<E> {
    config: AgentConfig,
    client: RelayClient,
    executor: Arc<E>,
}

/// Control handle for a running agent task.
pub struct AgentHandle {
    stop_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<AgentState>,
    stats: Arc<AgentStats>,
    task: JoinHandle<()>,
}

impl AgentHandle {
    pub fn state(&self) -> AgentState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state_rx.clone()
    }

    pub fn stats(&self) -> AgentStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop polling, let in-flight requests finish within the grace period,
    /// then unregister. Resolves with the final counters once the task exits.
    pub async fn stop(self) -> AgentStatsSnapshot {
        let _ = self.stop_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("Agent task ended abnormally: {e}");
        }
        self.stats.snapshot()
    }
}

impl<E: LocalExecutor> DeviceAgent<E> {
    pub fn new(
        config: AgentConfig,
        relay_key: Option<String>,
        executor: E,
    ) -> Result<Self, AgentError> {
        if !is_valid_id(&config.device_id) {
            return Err(AgentError::InvalidConfig(format!(
                "device_id '{}' must be 1-128 chars of [A-Za-z0-9-_.:]",
                config.device_id
            )));
        }
        if config.heartbeat_interval_secs == 0 {
            return Err(AgentError::InvalidConfig(
                "heartbeat_interval_secs must be positive".into(),
            ));
        }
        let client = RelayClient::new(&config.relay_url, relay_key).map_err(AgentError::Client)?;
        Ok(Self {
            config,
            client,
            executor: Arc::new(executor),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    /// Start the agent task. Never fails: relay outages are retried with backoff.
    pub fn spawn(&self) -> AgentHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (status, state_rx) = Status::new();
        let stats = Arc::new(AgentStats::default());
        let run = AgentRun {
            config: self.config.clone(),
            client: self.client.clone(),
            executor: self.executor.clone(),
            status,
            stats: stats.clone(),
        };
        let task = tokio::spawn(run.run(stop_rx));
        AgentHandle {
            stop_tx,
            state_rx,
            stats,
            task,
        }
    }
}

/// Everything one spawned agent task owns.
struct AgentRun<E> {
    config: AgentConfig,
    client: RelayClient,
    executor: Arc<E>,
    status: Arc<Status>,
    stats: Arc<AgentStats>,
}

impl<E: LocalExecutor> AgentRun<E> {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let base_delay = Duration::from_secs(self.config.reconnect_delay_secs);
        let max_delay = Duration::from_secs(self.config.reconnect_max_delay_secs).max(base_delay);
        let poll_wait = Duration::from_millis(self.config.poll_wait_ms);
        let device_id = self.config.device_id.clone();
        let needs_register = Arc::new(AtomicBool::new(true));

        let mut delay = base_delay;
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut heartbeat: Option<JoinHandle<()>> = None;

        'session: loop {
            if *stop_rx.borrow() {
                break;
            }

            if needs_register.load(Ordering::SeqCst) {
                if let Some(hb) = heartbeat.take() {
                    hb.abort();
                }
                self.status.set_phase(AgentState::Registering);
                info!(device_id = %device_id, relay = self.client.base_url(), "Registering with relay");
                let registration = self.registration();
                let registered = tokio::select! {
                    _ = stop_rx.changed() => break 'session,
                    r = self.client.register(&registration) => r,
                };
                match registered {
                    Ok(()) => {
                        info!(device_id = %device_id, "Registered");
                        needs_register.store(false, Ordering::SeqCst);
                        delay = base_delay;
                        heartbeat = Some(tokio::spawn(heartbeat_loop(
                            self.client.clone(),
                            self.config.clone(),
                            needs_register.clone(),
                        )));
                    }
                    Err(e) => {
                        warn!(device_id = %device_id, "Registration failed: {e}, retrying in {}s", delay.as_secs());
                        self.status.set_phase(AgentState::Unregistered);
                        self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                        if sleep_or_stop(delay, &mut stop_rx).await {
                            break 'session;
                        }
                        delay = (delay * 2).min(max_delay);
                        continue 'session;
                    }
                }
            }

            self.status.set_phase(AgentState::Polling);
            // Reap finished request tasks without blocking.
            while tasks.try_join_next().is_some() {}

            let polled = tokio::select! {
                _ = stop_rx.changed() => break 'session,
                r = self.client.poll(&device_id, poll_wait) => r,
            };
            match polled {
                Ok(requests) => {
                    delay = base_delay;
                    for request in requests {
                        debug!(device_id = %device_id, request_id = %request.request_id, method = %request.method, path = %request.path, "Executing relayed request");
                        tasks.spawn(serve_request(
                            self.client.clone(),
                            self.executor.clone(),
                            device_id.clone(),
                            request,
                            self.stats.clone(),
                            self.status.begin(),
                        ));
                    }
                }
                Err(e) => {
                    warn!(device_id = %device_id, "Poll failed: {e}, retrying in {}s", delay.as_secs());
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    if sleep_or_stop(delay, &mut stop_rx).await {
                        break 'session;
                    }
                    delay = (delay * 2).min(max_delay);
                }
            }
        }

        info!(device_id = %device_id, in_flight = tasks.len(), "Agent stopping");
        if let Some(hb) = heartbeat.take() {
            hb.abort();
        }
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(device_id = %device_id, abandoned = tasks.len(), "Grace period elapsed, aborting in-flight requests");
            tasks.shutdown().await;
        }

        match tokio::time::timeout(UNREGISTER_TIMEOUT, self.client.unregister(&device_id)).await {
            Ok(Ok(())) => info!(device_id = %device_id, "Unregistered"),
            Ok(Err(e)) => warn!(device_id = %device_id, "Unregister failed: {e}"),
            Err(_) => warn!(device_id = %device_id, "Unregister timed out"),
        }
        self.status.set_phase(AgentState::Stopped);
    }

    fn registration(&self) -> RegisterRequest {
        RegisterRequest {
            device_id: self.config.device_id.clone(),
            email: self.config.email.clone(),
            device_name: self.config.device_name.clone(),
            local_ip: self.config.local_ip.clone(),
            port: self.config.local_port,
        }
    }
}

/// Sleep for `delay` unless stopped first. Returns `true` when stopped.
async fn sleep_or_stop(delay: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *stop_rx.borrow(),
        _ = stop_rx.changed() => true,
    }
}

/// Heartbeat until the relay forgets us (404), then flag a re-registration.
async fn heartbeat_loop(client: RelayClient, config: AgentConfig, needs_register: Arc<AtomicBool>) {
    let every = Duration::from_secs(config.heartbeat_interval_secs);
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
    loop {
        interval.tick().await;
        match client
            .heartbeat(&config.device_id, config.local_ip.as_deref(), Some(config.local_port))
            .await
        {
            Ok(()) => debug!(device_id = %config.device_id, "Heartbeat ok"),
            Err(e) if e.is_not_found() => {
                warn!(device_id = %config.device_id, "Relay no longer knows this device, re-registering");
                needs_register.store(true, Ordering::SeqCst);
                return;
            }
            Err(e) => warn!(device_id = %config.device_id, "Heartbeat failed: {e}"),
        }
    }
}

/// Execute one request and post its response, retrying the post a few times.
async fn serve_request<E: LocalExecutor>(
    client: RelayClient,
    executor: Arc<E>,
    device_id: String,
    request: RequestEnvelope,
    stats: Arc<AgentStats>,
    _in_flight: InFlight,
) {
    let request_id = request.request_id.clone();
    let mut response = match executor.execute(&request).await {
        Ok(response) => {
            stats.served.fetch_add(1, Ordering::Relaxed);
            response
        }
        Err(e) => {
            warn!(device_id = %device_id, request_id = %request_id, "Local execution failed: {e}");
            stats.failed.fetch_add(1, Ordering::Relaxed);
            ResponseEnvelope::error(&request_id, 500, "LOCAL_EXECUTION_FAILED", &e.to_string())
        }
    };
    response.request_id.clone_from(&request_id);
    response.device_id = Some(device_id.clone());

    for attempt in 1..=RESPOND_ATTEMPTS {
        match client.respond(&response).await {
            Ok(ack) => {
                if !ack.delivered {
                    debug!(device_id = %device_id, request_id = %request_id, "Relay dropped the response (late or duplicate)");
                }
                return;
            }
            Err(e) if e.status() == Some(413) => {
                warn!(device_id = %device_id, request_id = %request_id, "Response too large for relay");
                response = ResponseEnvelope::error(
                    &request_id,
                    502,
                    "RESPONSE_TOO_LARGE",
                    "Device response exceeds the relay body limit",
                );
                response.device_id = Some(device_id.clone());
            }
            Err(e) if e.status().is_some_and(|s| (400..500).contains(&s)) => {
                warn!(device_id = %device_id, request_id = %request_id, "Relay rejected response: {e}");
                return;
            }
            Err(e) => {
                warn!(device_id = %device_id, request_id = %request_id, attempt, "Posting response failed: {e}");
                if attempt < RESPOND_ATTEMPTS {
                    tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                }
            }
        }
    }
}
