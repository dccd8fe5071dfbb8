//! # burrow-client
//!
//! Command-line client for a burrow relay: list devices and run HTTP requests
//! against the local server of a device behind the relay.
//!
//! ```text
//! burrow-client devices [--email owner@example.com]
//! burrow-client send pixel-7 GET /api/files --param path=/sdcard
//! burrow-client health
//! ```
//!
//! The relay URL and key come from `--relay-url` / `--relay-key` or the
//! `BURROW_RELAY_URL` / `BURROW_RELAY_KEY` environment variables.

use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use burrow_client::{ClientProxy, CommandRequest};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "burrow-client", version, about = "Reach devices behind a burrow relay")]
struct Cli {
    /// Relay base URL.
    #[arg(long, env = "BURROW_RELAY_URL", default_value = "http://127.0.0.1:8787")]
    relay_url: String,

    /// Shared relay key, sent as a Bearer token.
    #[arg(long, env = "BURROW_RELAY_KEY", hide_env_values = true)]
    relay_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered devices.
    Devices {
        /// Only devices owned by this email.
        #[arg(long)]
        email: Option<String>,
    },
    /// Send one HTTP request to a device and print its response.
    Send {
        device_id: String,
        method: String,
        path: String,
        /// Query parameter, repeatable.
        #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_pair)]
        params: Vec<(String, String)>,
        /// Request header, repeatable.
        #[arg(long = "header", value_name = "NAME=VALUE", value_parser = parse_pair)]
        headers: Vec<(String, String)>,
        /// Request body.
        #[arg(long)]
        body: Option<String>,
        /// How long to wait for the device's response.
        #[arg(long, default_value_t = 30_000)]
        timeout_ms: u64,
        /// Print response status and headers to stderr.
        #[arg(short, long)]
        verbose: bool,
    },
    /// Show the relay's health document.
    Health,
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()))
        .with_writer(std::io::stderr)
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("burrow-client: {e}");
            1
        }
    };
    std::process::exit(code);
}

/// Returns the process exit code: 0, or 2 when the device answered with a
/// non-2xx status.
async fn run(cli: Cli) -> Result<i32, String> {
    let proxy = ClientProxy::new(&cli.relay_url, cli.relay_key).map_err(|e| e.to_string())?;

    match cli.command {
        Commands::Devices { email } => {
            let devices = match email {
                Some(email) => proxy.list_devices(&email).await,
                None => proxy.list_all_devices().await,
            }
            .map_err(|e| e.to_string())?;
            print_json(&devices)?;
            Ok(0)
        }
        Commands::Health => {
            let health = proxy.health().await.map_err(|e| e.to_string())?;
            print_json(&health)?;
            Ok(0)
        }
        Commands::Send {
            device_id,
            method,
            path,
            params,
            headers,
            body,
            timeout_ms,
            verbose,
        } => {
            let mut command = CommandRequest::new(&method, &path);
            command.params = params.into_iter().collect::<HashMap<_, _>>();
            command.headers = headers.into_iter().collect::<HashMap<_, _>>();
            command.body = body.map(String::into_bytes);

            let resp = proxy
                .send_command(&device_id, command, Duration::from_millis(timeout_ms))
                .await
                .map_err(|e| e.to_string())?;

            if verbose {
                eprintln!("HTTP {} ({})", resp.status_code, resp.content_type);
                let mut names: Vec<_> = resp.headers.iter().collect();
                names.sort();
                for (k, v) in names {
                    eprintln!("{k}: {v}");
                }
            }
            let mut stdout = std::io::stdout().lock();
            stdout
                .write_all(&resp.body)
                .and_then(|()| stdout.flush())
                .map_err(|e| format!("Failed to write response: {e}"))?;
            Ok(if resp.is_success() { 0 } else { 2 })
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), String> {
    let text = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{text}");
    Ok(())
}
