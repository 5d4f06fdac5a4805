//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the forward proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, backlog).
    pub listener: ListenerConfig,

    /// Worker pool sizing.
    pub pool: PoolConfig,

    /// Request parsing limits.
    pub limits: LimitsConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Upstream connection reuse.
    pub upstream: UpstreamConfig,

    /// Response cache.
    pub cache: CacheConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Kernel accept backlog.
    pub backlog: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            backlog: 1024,
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum concurrently running connection handlers (N).
    pub max_workers: usize,

    /// Accepted connections allowed to wait for a worker (Q).
    pub queue_capacity: usize,

    /// How long shutdown waits for in-flight work before cancelling it.
    pub shutdown_grace_ms: u64,
}

impl PoolConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 64,
            queue_capacity: 256,
            shutdown_grace_ms: 10_000,
        }
    }
}

/// Request size limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum size of the request line plus headers in bytes.
    pub max_header_bytes: usize,

    /// Maximum number of header fields.
    pub max_headers: usize,

    /// Maximum length of the request target.
    pub max_uri_length: usize,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Maximum size of an upstream response head in bytes.
    pub max_response_header_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_header_bytes: 16 * 1024,
            max_headers: 64,
            max_uri_length: 4096,
            max_body_bytes: 2 * 1024 * 1024, // 2MB
            max_response_header_bytes: 64 * 1024,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Name resolution plus connection establishment, in milliseconds.
    pub connect_ms: u64,

    /// No bytes in either direction for this long closes the connection.
    pub idle_ms: u64,

    /// Total time for one request/response exchange.
    pub request_ms: u64,

    /// Total lifetime of a client connection, tunnels included.
    pub connection_ms: u64,
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }

    pub fn request(&self) -> Duration {
        Duration::from_millis(self.request_ms)
    }

    pub fn connection(&self) -> Duration {
        Duration::from_millis(self.connection_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 5_000,
            idle_ms: 60_000,
            request_ms: 30_000,
            connection_ms: 3_600_000,
        }
    }
}

/// Upstream connection reuse configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Keep idle origin connections for reuse.
    pub pool_enabled: bool,

    /// Idle connections kept per (host, port).
    pub max_idle_per_host: usize,

    /// Idle connections older than this are discarded instead of reused.
    pub idle_stale_ms: u64,
}

impl UpstreamConfig {
    pub fn idle_stale(&self) -> Duration {
        Duration::from_millis(self.idle_stale_ms)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            pool_enabled: true,
            max_idle_per_host: 8,
            idle_stale_ms: 30_000,
        }
    }
}

/// Response cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable the response cache.
    pub enabled: bool,

    /// Default and maximum freshness lifetime in milliseconds.
    pub ttl_ms: u64,

    /// Maximum number of stored responses.
    pub max_entries: usize,

    /// Maximum total stored bytes.
    pub max_bytes: usize,

    /// Responses larger than this are never stored.
    pub max_entry_bytes: usize,

    /// Number of independently locked shards.
    pub shards: usize,

    /// Background sweep interval in milliseconds (0 disables the sweeper).
    pub sweep_interval_ms: u64,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 60_000,
            max_entries: 1024,
            max_bytes: 64 * 1024 * 1024,
            max_entry_bytes: 1024 * 1024,
            shards: 16,
            sweep_interval_ms: 30_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines instead of the human-readable format.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
