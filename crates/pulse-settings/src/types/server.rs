//! Listener and sync-layer settings.

use serde::{Deserialize, Serialize};

/// Network listener settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port (`0` picks a free port).
    pub port: u16,
    /// Maximum concurrent WebSocket connections across all users.
    pub max_connections: usize,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_message_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            max_connections: 10_000,
            max_message_size: 1024 * 1024,
        }
    }
}

/// Fan-out and idle reaping settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncSettings {
    /// Per-connection send timeout in milliseconds before a device is dropped.
    pub send_timeout_ms: u64,
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
    /// How often the idle reaper sweeps, in seconds.
    pub reap_interval_secs: u64,
    /// Inactivity after which a connection is reaped, in seconds.
    pub idle_threshold_secs: u64,
    /// Interval between transport-level ping frames, in seconds.
    pub ping_interval_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            send_timeout_ms: 5_000,
            outbound_buffer: 256,
            reap_interval_secs: 300,
            idle_threshold_secs: 1_800,
            ping_interval_secs: 30,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reaper_defaults() {
        let sync = SyncSettings::default();
        assert_eq!(sync.reap_interval_secs, 5 * 60);
        assert_eq!(sync.idle_threshold_secs, 30 * 60);
    }

    #[test]
    fn camel_case_keys() {
        let json = serde_json::to_value(ServerSettings::default()).unwrap();
        assert!(json.get("maxConnections").is_some());
        assert!(json.get("maxMessageSize").is_some());
    }
}
