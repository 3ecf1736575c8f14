//! # sockroute
//!
//! Server-side WebSocket application layer built on tokio and axum.
//!
//! This crate provides:
//! - HTTP upgrade handling that plugs into any axum router
//! - Per-connection frame reassembly with RFC 6455 protocol checks
//! - Named-message dispatch over a `{"name", "data"}` JSON envelope
//! - Connection registry with connect/disconnect hooks and broadcast
//! - Channels for scoped broadcast with self-healing membership
//! - Graceful, terminal shutdown

pub mod config;
pub mod logging;
pub mod websocket;

pub use config::{ConfigError, WebSocketConfig, WebSocketDefaults};
pub use logging::{init_logging, LoggingConfig};
pub use websocket::{
    BroadcastResult, Channel, CloseCode, Connection, ConnectionId, DataKind, Message, Server,
    ServerState, WebSocketError, WebSocketResult,
};

// Re-exported for `Server::start_with`
pub use tokio_util::sync::CancellationToken;
