#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

//! burrow-client library: reach HTTP servers on devices behind a burrow relay.
//!
//! ```no_run
//! # async fn demo() -> Result<(), burrow_client::ProxyError> {
//! use std::time::Duration;
//! use burrow_client::{ClientProxy, CommandRequest};
//!
//! let proxy = ClientProxy::new("https://relay.example.com", None)?;
//! let resp = proxy
//!     .send_command(
//!         "pixel-7",
//!         CommandRequest::get("/api/files").param("path", "/sdcard"),
//!         Duration::from_secs(30),
//!     )
//!     .await?;
//! println!("{} {}", resp.status_code, resp.text());
//! # Ok(())
//! # }
//! ```

pub mod proxy;

pub use burrow::DeviceRecord;
pub use proxy::{ClientProxy, CommandRequest, PendingCall, ProxyError, ProxyResponse};
