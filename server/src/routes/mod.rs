//! HTTP route handlers.
//!
//! Each sub-module corresponds to an endpoint group. All handlers except
//! [`health`] sit behind the [`crate::auth::require_relay_key`] middleware,
//! which is a no-op unless `auth.relay_key` is configured.

pub mod devices;
pub mod health;
pub mod proxy;
