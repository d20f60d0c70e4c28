//! Server configuration.

use std::time::Duration;

use pulse_settings::PulseSettings;
use serde::{Deserialize, Serialize};

/// Runtime configuration for [`SyncServer`](crate::server::SyncServer).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Upgrades are refused with 503 once this many devices are connected.
    pub max_connections: usize,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Per-connection send timeout in milliseconds.
    pub send_timeout_ms: u64,
    /// Outbound queue depth per connection.
    pub outbound_buffer: usize,
    /// Seconds between idle sweeps.
    pub reap_interval_secs: u64,
    /// Seconds without inbound activity before a connection is reaped.
    pub idle_threshold_secs: u64,
    /// Seconds between server Ping frames.
    pub ping_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 10_000,
            max_message_size: 1024 * 1024,
            send_timeout_ms: 5_000,
            outbound_buffer: 256,
            reap_interval_secs: 300,
            idle_threshold_secs: 30 * 60,
            ping_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Take the server and sync sections of loaded settings.
    pub fn from_settings(settings: &PulseSettings) -> Self {
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_connections: settings.server.max_connections,
            max_message_size: settings.server.max_message_size,
            send_timeout_ms: settings.sync.send_timeout_ms,
            outbound_buffer: settings.sync.outbound_buffer,
            reap_interval_secs: settings.sync.reap_interval_secs,
            idle_threshold_secs: settings.sync.idle_threshold_secs,
            ping_interval_secs: settings.sync.ping_interval_secs,
        }
    }

    /// `host:port`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Send timeout.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// Idle sweep period.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    /// Idle threshold.
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    /// Ping period.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}
