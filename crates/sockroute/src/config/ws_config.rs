//! WebSocket server configuration
//!
//! Values come from defaults, environment variables (`WS_*`), or are set
//! directly before the server is built.

use super::defaults::WebSocketDefaults;
use super::error::{ConfigError, ConfigSource};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const ENV_WRITE_TIMEOUT: &str = "WS_WRITE_TIMEOUT";
const ENV_PING_INTERVAL: &str = "WS_PING_INTERVAL";
const ENV_CLOSE_TIMEOUT: &str = "WS_CLOSE_TIMEOUT";
const ENV_MAX_MESSAGE_SIZE: &str = "WS_MAX_MESSAGE_SIZE";
const ENV_MAX_FRAME_SIZE: &str = "WS_MAX_FRAME_SIZE";
const ENV_BROADCAST_QUEUE_SIZE: &str = "WS_BROADCAST_QUEUE_SIZE";
const ENV_BROADCAST_CONCURRENCY: &str = "WS_BROADCAST_CONCURRENCY";

/// Runtime settings shared by the server, its connections and read loops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebSocketConfig {
    /// Upper bound for a single frame write, in seconds
    pub write_timeout_secs: u64,
    /// Keepalive ping period in seconds, 0 disables keepalive
    pub ping_interval_secs: u64,
    /// Upper bound for the close handshake write, in seconds
    pub close_timeout_secs: u64,
    /// Largest reassembled message accepted from a peer
    pub max_message_size: usize,
    /// Largest single frame payload accepted from a peer
    pub max_frame_size: usize,
    /// Pending server-wide broadcasts before `emit` waits
    pub broadcast_queue_size: usize,
    /// Concurrent per-connection deliveries during one broadcast
    pub broadcast_concurrency: usize,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            write_timeout_secs: WebSocketDefaults::WRITE_TIMEOUT_SECS,
            ping_interval_secs: WebSocketDefaults::PING_INTERVAL_SECS,
            close_timeout_secs: WebSocketDefaults::CLOSE_TIMEOUT_SECS,
            max_message_size: WebSocketDefaults::MAX_MESSAGE_SIZE,
            max_frame_size: WebSocketDefaults::MAX_FRAME_SIZE,
            broadcast_queue_size: WebSocketDefaults::BROADCAST_QUEUE_SIZE,
            broadcast_concurrency: WebSocketDefaults::BROADCAST_CONCURRENCY,
        }
    }
}

impl WebSocketConfig {
    /// Load configuration from `WS_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            write_timeout_secs: env_or_default(
                ENV_WRITE_TIMEOUT,
                "write_timeout_secs",
                WebSocketDefaults::WRITE_TIMEOUT_SECS,
                "valid number of seconds",
            )?,
            ping_interval_secs: env_or_default(
                ENV_PING_INTERVAL,
                "ping_interval_secs",
                WebSocketDefaults::PING_INTERVAL_SECS,
                "valid number of seconds",
            )?,
            close_timeout_secs: env_or_default(
                ENV_CLOSE_TIMEOUT,
                "close_timeout_secs",
                WebSocketDefaults::CLOSE_TIMEOUT_SECS,
                "valid number of seconds",
            )?,
            max_message_size: env_or_default(
                ENV_MAX_MESSAGE_SIZE,
                "max_message_size",
                WebSocketDefaults::MAX_MESSAGE_SIZE,
                "valid number of bytes",
            )?,
            max_frame_size: env_or_default(
                ENV_MAX_FRAME_SIZE,
                "max_frame_size",
                WebSocketDefaults::MAX_FRAME_SIZE,
                "valid number of bytes",
            )?,
            broadcast_queue_size: env_or_default(
                ENV_BROADCAST_QUEUE_SIZE,
                "broadcast_queue_size",
                WebSocketDefaults::BROADCAST_QUEUE_SIZE,
                "positive integer",
            )?,
            broadcast_concurrency: env_or_default(
                ENV_BROADCAST_CONCURRENCY,
                "broadcast_concurrency",
                WebSocketDefaults::BROADCAST_CONCURRENCY,
                "positive integer",
            )?,
        })
    }

    /// Validate the WebSocket configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_timeout_secs == 0 {
            return Err(ConfigError::validation_failed(
                "write_timeout_secs",
                "Write timeout must be greater than 0",
            ));
        }

        if self.close_timeout_secs == 0 {
            return Err(ConfigError::validation_failed(
                "close_timeout_secs",
                "Close timeout must be greater than 0",
            ));
        }

        if self.max_message_size == 0 || self.max_frame_size == 0 {
            return Err(ConfigError::validation_failed(
                "max_message_size",
                "Message and frame size limits must be greater than 0",
            ));
        }

        if self.max_frame_size > self.max_message_size {
            return Err(ConfigError::validation_failed(
                "max_frame_size",
                "Frame size limit cannot exceed the message size limit",
            ));
        }

        if self.broadcast_queue_size == 0 {
            return Err(ConfigError::validation_failed(
                "broadcast_queue_size",
                "Broadcast queue size must be greater than 0",
            ));
        }

        if self.broadcast_concurrency == 0 {
            return Err(ConfigError::validation_failed(
                "broadcast_concurrency",
                "Broadcast concurrency must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Report which environment variable backs each field and whether it was set
    pub fn config_sources(&self) -> HashMap<String, ConfigSource> {
        [
            ("write_timeout_secs", ENV_WRITE_TIMEOUT),
            ("ping_interval_secs", ENV_PING_INTERVAL),
            ("close_timeout_secs", ENV_CLOSE_TIMEOUT),
            ("max_message_size", ENV_MAX_MESSAGE_SIZE),
            ("max_frame_size", ENV_MAX_FRAME_SIZE),
            ("broadcast_queue_size", ENV_BROADCAST_QUEUE_SIZE),
            ("broadcast_concurrency", ENV_BROADCAST_CONCURRENCY),
        ]
        .into_iter()
        .map(|(field, var)| {
            let source = if env::var(var).is_ok() {
                ConfigSource::EnvVar(var.to_string())
            } else {
                ConfigSource::Default(var.to_string())
            };
            (field.to_string(), source)
        })
        .collect()
    }

    /// Get write timeout as Duration
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Get keepalive interval, `None` when keepalive is disabled
    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }

    /// Get close handshake timeout as Duration
    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    pub fn with_write_timeout(mut self, seconds: u64) -> Self {
        self.write_timeout_secs = seconds;
        self
    }

    pub fn with_ping_interval(mut self, seconds: u64) -> Self {
        self.ping_interval_secs = seconds;
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn with_max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes;
        self
    }

    pub fn with_broadcast_concurrency(mut self, limit: usize) -> Self {
        self.broadcast_concurrency = limit;
        self
    }
}

fn env_or_default<T>(key: &str, field: &str, default: T, expected: &str) -> Result<T, ConfigError>
where
    T: FromStr,
{
    match env::var(key) {
        Ok(value) => value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
            field: field.to_string(),
            value,
            expected: expected.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
