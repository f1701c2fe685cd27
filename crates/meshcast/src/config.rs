//! Sender, socket and pool configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_MAX_BODY;
use crate::error::{Result, SendError};

/// Socket options applied to every outbound connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    /// Disable Nagle's algorithm.
    pub tcp_nodelay: bool,
    /// Enable SO_KEEPALIVE.
    pub so_keepalive: bool,
    /// SO_LINGER in seconds; `None` leaves the OS default.
    pub so_linger_secs: Option<u32>,
    /// IP_TOS traffic class; `None` leaves the OS default.
    pub traffic_class: Option<u32>,
    /// SO_SNDBUF in bytes; 0 leaves the OS default.
    pub tx_buffer_size: usize,
    /// SO_RCVBUF in bytes; 0 leaves the OS default.
    pub rx_buffer_size: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            so_keepalive: true,
            so_linger_secs: Some(3),
            traffic_class: Some(0x04 | 0x08 | 0x10),
            tx_buffer_size: 25188,
            rx_buffer_size: 25188,
        }
    }
}

/// Sender pool sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Senders created up front and kept when replacing unhealthy ones.
    pub min_idle: usize,
    /// Maximum number of senders, idle plus checked out.
    pub max_senders: usize,
    /// How long `acquire` waits for a free sender.
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_idle: 0,
            max_senders: 25,
            acquire_timeout_ms: 3000,
        }
    }
}

impl PoolConfig {
    /// `acquire_timeout_ms` as a duration.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Broadcast behaviour shared by every dispatcher of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Overall deadline for one `send_message` call.
    pub timeout_ms: u64,
    /// Deadline for a single TCP handshake.
    pub connect_timeout_ms: u64,
    /// Maximum silence while writing or waiting for an acknowledgement.
    pub io_timeout_ms: u64,
    /// Reconnect-and-resend attempts per member after the first try.
    pub max_retry_attempts: u32,
    /// Upper bound on a single reactor wait.
    pub poll_interval_ms: u64,
    /// Whether payloads built from this config ask for an acknowledgement.
    pub require_ack: bool,
    /// Fail members already marked failing without touching the network.
    pub skip_failing_members: bool,
    /// Close connections idle for longer than this when a sender is released.
    pub keepalive_idle_ms: Option<u64>,
    /// Largest accepted payload.
    pub max_payload_bytes: u32,
    /// Socket options.
    pub socket: SocketOptions,
    /// Pool sizing.
    pub pool: PoolConfig,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            connect_timeout_ms: 3000,
            io_timeout_ms: 3000,
            max_retry_attempts: 1,
            poll_interval_ms: 5000,
            require_ack: true,
            skip_failing_members: false,
            keepalive_idle_ms: None,
            max_payload_bytes: DEFAULT_MAX_BODY,
            socket: SocketOptions::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl SenderConfig {
    /// Loads a config from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: SenderConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| SendError::Config(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| SendError::Config(e.to_string()))?
            }
            _ => {
                return Err(SendError::Config(format!(
                    "unsupported config file extension: {ext}"
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the dispatcher or pool cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(SendError::Config("timeout_ms must be positive".into()));
        }
        if self.poll_interval_ms == 0 {
            return Err(SendError::Config("poll_interval_ms must be positive".into()));
        }
        if self.connect_timeout_ms == 0 || self.io_timeout_ms == 0 {
            return Err(SendError::Config(
                "connect_timeout_ms and io_timeout_ms must be positive".into(),
            ));
        }
        if self.pool.max_senders == 0 {
            return Err(SendError::Config("pool.max_senders must be positive".into()));
        }
        if self.pool.min_idle > self.pool.max_senders {
            return Err(SendError::Config(format!(
                "pool.min_idle ({}) exceeds pool.max_senders ({})",
                self.pool.min_idle, self.pool.max_senders
            )));
        }
        Ok(())
    }

    /// `timeout_ms` as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// `connect_timeout_ms` as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `io_timeout_ms` as a duration.
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// `poll_interval_ms` as a duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// `keepalive_idle_ms` as a duration.
    pub fn keepalive_idle(&self) -> Option<Duration> {
        self.keepalive_idle_ms.map(Duration::from_millis)
    }
}
