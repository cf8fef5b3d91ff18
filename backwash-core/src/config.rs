//! Centralized configuration for Backwash.
//!
//! Tunable parameters for rewind buffers, listeners and replication live
//! here instead of being scattered through the server code.

use std::time::Duration;

/// Central configuration for all Backwash components.
///
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct BackwashConfig {
    pub rewind: RewindConfig,
    pub listener: ListenerConfig,
    pub replication: ReplicationConfig,
}

/// Rewind buffer sizing.
#[derive(Debug, Clone, PartialEq)]
pub struct RewindConfig {
    /// Seconds of audio kept per stream
    pub buffer_seconds: f64,
    /// Seconds of audio a new listener receives immediately
    pub initial_burst_secs: f64,
    /// Bytes handed to the transport per listener or dump read
    pub read_size: usize,
}

impl Default for RewindConfig {
    fn default() -> Self {
        Self {
            buffer_seconds: 300.0, // 5 minutes
            initial_burst_secs: 15.0,
            read_size: 65536, // 64 KiB
        }
    }
}

/// Listener housekeeping.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Queued bytes after which a listener counts as too slow to keep
    pub max_queued_bytes: usize,
    /// How often listener stats are reported and slow listeners dropped
    pub housekeeping_interval: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_queued_bytes: 8 * 1024 * 1024,
            housekeeping_interval: Duration::from_secs(30),
        }
    }
}

/// Replica warm start from a master relay.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Base URL of the master relay; `None` runs standalone
    pub master_url: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            master_url: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl BackwashConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Values that fail to parse are ignored and the default kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(seconds) = std::env::var("BACKWASH_BUFFER_SECONDS") {
            if let Ok(seconds) = seconds.parse::<f64>() {
                config.rewind.buffer_seconds = seconds;
            }
        }

        if let Ok(burst) = std::env::var("BACKWASH_INITIAL_BURST") {
            if let Ok(burst) = burst.parse::<f64>() {
                config.rewind.initial_burst_secs = burst;
            }
        }

        if let Ok(max_bytes) = std::env::var("BACKWASH_MAX_QUEUED_BYTES") {
            if let Ok(max_bytes) = max_bytes.parse::<usize>() {
                config.listener.max_queued_bytes = max_bytes;
            }
        }

        if let Ok(url) = std::env::var("BACKWASH_MASTER_URL") {
            if !url.trim().is_empty() {
                config.replication.master_url = Some(url.trim().to_string());
            }
        }

        config
    }

    /// Creates a configuration with a short window and fast housekeeping.
    pub fn for_testing() -> Self {
        Self {
            rewind: RewindConfig {
                buffer_seconds: 30.0,
                initial_burst_secs: 2.0,
                read_size: 4096,
            },
            listener: ListenerConfig {
                max_queued_bytes: 64 * 1024,
                housekeeping_interval: Duration::from_millis(50),
            },
            replication: ReplicationConfig {
                master_url: None,
                connect_timeout: Duration::from_secs(1),
            },
        }
    }
}
