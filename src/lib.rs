#![forbid(unsafe_code)]

//! Session client and multi-session manager for stdio JSON-RPC tool
//! providers.
//!
//! - [`transport`]: child process spawning and NDJSON framing.
//! - [`session`]: one provider connection with request correlation,
//!   notification dispatch, catalog cache and lifecycle.
//! - [`manager`]: named registry supervising many sessions.

pub mod config;
pub mod errors;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
