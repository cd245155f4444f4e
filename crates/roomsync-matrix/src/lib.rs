//! Tokio poll loop and HTTP transport for the roomsync engine.
//!
//! [`SyncClient`] drives any [`roomsync_core::Transport`]; [`HttpTransport`]
//! is the one that talks to a real homeserver.

mod client;
pub mod config;
mod http;

pub use client::{ErrorHandler, SyncClient};
pub use config::{ClientConfig, ConfigError};
pub use http::{
    DEFAULT_MAX_RATE_LIMIT_RETRIES, DEFAULT_RATE_LIMIT_WAIT_MS, HttpTransport, HttpTransportConfig,
    parse_retry_after_ms, sync_query,
};
