#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! burrow library. Exposes the relay building blocks for downstream crates
//! (e.g. `burrow-client`).
//!
//! This library re-exports the key building blocks:
//! - `envelope` — request/response envelopes exchanged through the relay
//! - `registry` — device records and liveness
//! - `mailbox` — per-device queues and request/response correlation
//! - `tunnel` — relay router, relay HTTP client and the device agent
//! - `auth` — optional relay key middleware
//! - `config` — configuration loading
//! - `routes` — REST route handlers

pub mod auth;
pub mod config;
pub mod envelope;
pub mod error;
pub mod mailbox;
pub mod registry;
pub mod routes;
pub mod state;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use config::Config;
pub use envelope::{RequestEnvelope, ResponseEnvelope};
pub use error::RelayError;
pub use mailbox::Mailbox;
pub use registry::{DeviceRecord, Registry};
pub use state::RelayState;
pub use tunnel::agent::{AgentHandle, AgentState, DeviceAgent};
pub use tunnel::relay_client::{ClientError, RelayClient};
