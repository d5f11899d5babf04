//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for the forwarding proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, admission limit).
    pub listener: ListenerConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// On-disk response cache.
    pub cache: CacheConfig,

    /// Relay tuning.
    pub relay: RelayConfig,

    /// Request framing limits.
    pub limits: LimitsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent client connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 1024,
        }
    }
}

impl ListenerConfig {
    /// Replace the port of `bind_address`, keeping the host part.
    pub fn set_port(&mut self, port: u16) {
        let host = match self.bind_address.rsplit_once(':') {
            Some((host, _)) => host.to_string(),
            None => self.bind_address.clone(),
        };
        self.bind_address = format!("{}:{}", host, port);
    }
}

/// Timeout configuration. A value of zero disables the timeout.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Origin connection establishment (including name resolution), in seconds.
    pub connect_secs: u64,

    /// Idle bound on each read from the client while parsing, in seconds.
    pub client_read_secs: u64,

    /// Idle bound on each read from the origin while relaying, in seconds.
    pub origin_read_secs: u64,

    /// How long shutdown waits for in-flight connections, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            client_read_secs: 30,
            origin_read_secs: 60,
            shutdown_grace_secs: 10,
        }
    }
}

fn optional_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl TimeoutConfig {
    pub fn connect(&self) -> Option<Duration> {
        optional_secs(self.connect_secs)
    }

    pub fn client_read(&self) -> Option<Duration> {
        optional_secs(self.client_read_secs)
    }

    pub fn origin_read(&self) -> Option<Duration> {
        optional_secs(self.origin_read_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// On-disk cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Store GET responses and replay them on identical request targets.
    pub enabled: bool,

    /// Directory holding one file per cached response. Created on first use.
    pub directory: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from("ProxyCache"),
        }
    }
}

/// Relay configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Size of the buffer used for each origin read and cache replay read.
    pub chunk_size: usize,

    /// Write a status line to the client when a request fails before any
    /// response bytes were sent. When false the client socket is simply closed.
    pub error_responses: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8192,
            error_responses: true,
        }
    }
}

/// Limits applied while framing a client request.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum size of the header block, request line included.
    pub max_header_bytes: usize,

    /// Maximum declared Content-Length accepted for a POST body.
    pub max_body_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: 64 * 1024,
            max_body_bytes: 64 * 1024 * 1024,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
