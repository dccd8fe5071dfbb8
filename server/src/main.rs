#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # burrow
//!
//! Long-poll relay that lets clients reach HTTP servers running on devices
//! without a public address (phones on carrier NAT, home boxes, ...).
//!
//! ## Subcommands
//!
//! - `burrow relay` (default) — run the public relay service
//! - `burrow agent` — run on the device: register, poll, replay requests
//!   against `127.0.0.1:<local_port>`
//!
//! ## API surface
//!
//! | Method | Path                             | Description                          |
//! |--------|----------------------------------|--------------------------------------|
//! | GET    | `/health`                        | Liveness check (no auth)             |
//! | GET    | `/`                              | Service banner (no auth)             |
//! | POST   | `/register`                      | Register or refresh a device         |
//! | POST   | `/heartbeat/{device_id}`         | Refresh liveness                     |
//! | DELETE | `/unregister/{device_id}`        | Go offline, drain outstanding        |
//! | GET    | `/devices`, `/devices/{email}`   | List devices                         |
//! | POST   | `/proxy/send`                    | Enqueue a request for a device       |
//! | GET    | `/proxy/poll/{device_id}`        | Device long-poll                     |
//! | POST   | `/proxy/respond`                 | Device posts a response              |
//! | GET    | `/proxy/await/{request_id}`      | Client waits for the response        |
//! | DELETE | `/proxy/requests/{request_id}`   | Client abandons a request            |
//! | POST   | `/proxy/{device_id}/upload`      | Multipart file upload to a device    |
//! | ANY    | `/d/{device_id}/{*path}`         | Transparent HTTP proxy to a device   |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, graceful shutdown
//! auth.rs          — optional relay key middleware, constant-time comparison
//! config.rs        — TOML + env-var configuration
//! envelope.rs      — request/response envelopes, validation
//! registry.rs      — device records and liveness window
//! mailbox.rs       — per-device queues, correlation table, TTL sweep
//! routes/
//!   health.rs      — GET /health, GET /
//!   devices.rs     — register, heartbeat, unregister, listing
//!   proxy.rs       — send, poll, respond, await, abandon, /d/ proxy
//! tunnel/
//!   relay.rs       — router assembly, serve, sweeper
//!   relay_client.rs — reqwest client for the relay endpoints
//!   executor.rs    — LocalExecutor seam, loopback HTTP executor
//!   agent.rs       — device agent loop, heartbeat, backoff, stop
//! ```

use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use burrow::tunnel::executor::LoopbackExecutor;
use burrow::tunnel::relay;
use burrow::{Config, DeviceAgent, RelayState};

/// Long-poll relay tunnel for devices without a public address.
#[derive(Parser)]
#[command(name = "burrow", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay service (default when no subcommand given).
    Relay {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run the device agent against a relay.
    Agent {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Agent { config }) => run_agent(config.as_deref()).await,
        Some(Commands::Relay { config }) => run_relay(config.as_deref()).await,
        None => run_relay(None).await,
    };
    if let Err(e) = result {
        error!("{e}");
        eprintln!("burrow: {e}");
        std::process::exit(1);
    }
}

fn init_tracing(config: &Config) {
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();
}

async fn run_relay(config_path: Option<&str>) -> Result<(), String> {
    let config = Config::load(config_path)?;
    init_tracing(&config);

    info!("burrow relay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    if config.auth.relay_key.is_none() {
        warn!("No relay key configured, the relay is open to anyone who can reach it");
    }

    let listener = TcpListener::bind(&config.server.listen)
        .await
        .map_err(|e| format!("Failed to bind {}: {e}", config.server.listen))?;
    let state = RelayState::new(config);
    let sweeper = relay::spawn_sweeper(state.clone());

    // Parked awaits are answered with a 502 before connections drain.
    let drain_state = state.clone();
    let shutdown = async move {
        shutdown_signal().await;
        info!("Shutting down...");
        drain_state.mailbox.drain_all("relay shutting down").await;
    };

    info!("Relay ready");
    relay::serve(listener, state.clone(), shutdown)
        .await
        .map_err(|e| format!("Server error: {e}"))?;

    sweeper.abort();
    let stats = state.mailbox.stats().await;
    info!(
        enqueued = stats.enqueued_total,
        resolved = stats.resolved_total,
        expired = stats.expired_total,
        "Goodbye"
    );
    Ok(())
}

async fn run_agent(config_path: Option<&str>) -> Result<(), String> {
    let config = Config::load(config_path)?;
    init_tracing(&config);

    let agent_config = config
        .agent
        .clone()
        .ok_or("No [agent] section configured (or set BURROW_RELAY_URL, BURROW_DEVICE_ID, BURROW_EMAIL)")?;

    info!("burrow agent v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Device {} → relay {}, local server 127.0.0.1:{}",
        agent_config.device_id, agent_config.relay_url, agent_config.local_port
    );
    if agent_config.heartbeat_interval_secs >= config.relay.liveness_window_secs {
        warn!(
            "heartbeat_interval_secs ({}) should be below the relay liveness window ({}s)",
            agent_config.heartbeat_interval_secs, config.relay.liveness_window_secs
        );
    }

    let executor = LoopbackExecutor::new(
        agent_config.local_port,
        Duration::from_secs(agent_config.local_timeout_secs),
    );
    let agent = DeviceAgent::new(agent_config, config.auth.relay_key.clone(), executor)
        .map_err(|e| e.to_string())?;
    let handle = agent.spawn();

    shutdown_signal().await;
    info!("Stopping agent...");
    let stats = handle.stop().await;
    info!(
        served = stats.served,
        failed = stats.failed,
        reconnects = stats.reconnects,
        "Goodbye"
    );
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                ctrl_c.await.ok();
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received SIGINT");
    }
}
