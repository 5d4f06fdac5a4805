//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (sizes > 0, timeouts > 0, addresses parse)
//! - Check cache bounds are consistent with each other
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    let non_zero = [
        ("pool.max_workers", config.pool.max_workers as u64),
        ("limits.max_header_bytes", config.limits.max_header_bytes as u64),
        ("limits.max_headers", config.limits.max_headers as u64),
        ("limits.max_uri_length", config.limits.max_uri_length as u64),
        (
            "limits.max_response_header_bytes",
            config.limits.max_response_header_bytes as u64,
        ),
        ("timeouts.connect_ms", config.timeouts.connect_ms),
        ("timeouts.idle_ms", config.timeouts.idle_ms),
        ("timeouts.request_ms", config.timeouts.request_ms),
        ("timeouts.connection_ms", config.timeouts.connection_ms),
    ];
    for (field, value) in non_zero {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than zero"));
        }
    }

    if config.limits.max_uri_length > config.limits.max_header_bytes {
        errors.push(ValidationError::new(
            "limits.max_uri_length",
            "cannot exceed limits.max_header_bytes",
        ));
    }

    if config.cache.enabled {
        let cache = &config.cache;
        if cache.ttl_ms == 0 {
            errors.push(ValidationError::new("cache.ttl_ms", "must be greater than zero"));
        }
        if cache.shards == 0 {
            errors.push(ValidationError::new("cache.shards", "must be greater than zero"));
        }
        if cache.max_entries < cache.shards {
            errors.push(ValidationError::new(
                "cache.max_entries",
                "must be at least cache.shards",
            ));
        }
        if cache.max_entry_bytes > cache.max_bytes / cache.shards.max(1) {
            errors.push(ValidationError::new(
                "cache.max_entry_bytes",
                "must fit within one shard's share of cache.max_bytes",
            ));
        }
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
