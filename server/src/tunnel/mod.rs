//! Reverse tunnel for devices behind NAT.
//!
//! Provides two modes:
//!
//! - **Relay** (`burrow relay`): public HTTP rendezvous. Devices register and
//!   long-poll; clients enqueue requests and await correlated responses.
//! - **Agent** (`burrow agent`): runs on the device, polls the relay and
//!   replays each request against the local HTTP server.

pub mod agent;
pub mod executor;
pub mod relay;
pub mod relay_client;
