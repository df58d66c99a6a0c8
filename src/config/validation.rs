//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (unique backend ids)
//! - Validate value ranges (timeouts > 0, pool bounds ordered)
//! - Check endpoint shape against the declared transport
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AggregatorConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use thiserror::Error;
use url::Url;

use crate::config::schema::{AggregatorConfig, BackendConfig, TransportKind, CURRENT_SCHEMA_VERSION};

/// A single semantic problem in a configuration document.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unsupported schema_version {found} (expected {expected})")]
    SchemaVersion { found: u32, expected: u32 },

    #[error("backend #{index} has an empty id")]
    EmptyBackendId { index: usize },

    #[error("duplicate backend id '{id}'")]
    DuplicateBackendId { id: String },

    #[error("backend '{id}': {reason}")]
    InvalidEndpoint { id: String, reason: String },

    #[error("backend '{id}': weight must be at least 1")]
    ZeroWeight { id: String },

    #[error("{field} must be greater than zero")]
    NonPositive { field: &'static str },

    #[error("pool.min_idle ({min_idle}) exceeds pool.max_size ({max_size})")]
    PoolBounds { min_idle: usize, max_size: usize },

    #[error("circuit_breaker.backoff_multiplier must be >= 1.0 (got {0})")]
    BackoffMultiplier(String),
}

/// Validate a parsed configuration, collecting every problem found.
pub fn validate_config(config: &AggregatorConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.schema_version != CURRENT_SCHEMA_VERSION {
        errors.push(ValidationError::SchemaVersion {
            found: config.schema_version,
            expected: CURRENT_SCHEMA_VERSION,
        });
    }

    let mut seen = HashSet::new();
    for (index, backend) in config.backends.iter().enumerate() {
        if backend.id.trim().is_empty() {
            errors.push(ValidationError::EmptyBackendId { index });
            continue;
        }
        if !seen.insert(backend.id.as_str()) {
            errors.push(ValidationError::DuplicateBackendId { id: backend.id.clone() });
        }
        if backend.weight == 0 {
            errors.push(ValidationError::ZeroWeight { id: backend.id.clone() });
        }
        if let Err(reason) = check_endpoint(backend) {
            errors.push(ValidationError::InvalidEndpoint { id: backend.id.clone(), reason });
        }
    }

    let positives: [(&'static str, u64); 10] = [
        ("ring.virtual_nodes", config.ring.virtual_nodes as u64),
        ("circuit_breaker.failure_threshold", config.circuit_breaker.failure_threshold as u64),
        ("circuit_breaker.cooldown_ms", config.circuit_breaker.cooldown_ms),
        ("pool.max_size", config.pool.max_size as u64),
        ("pool.acquire_timeout_ms", config.pool.acquire_timeout_ms),
        ("timeouts.connect_ms", config.timeouts.connect_ms),
        ("timeouts.backend_call_ms", config.timeouts.backend_call_ms),
        ("timeouts.request_ms", config.timeouts.request_ms),
        ("retries.max_attempts", config.retries.max_attempts as u64),
        ("cache.shards", config.cache.shards as u64),
    ];
    for (field, value) in positives {
        if value == 0 {
            errors.push(ValidationError::NonPositive { field });
        }
    }

    if config.health_check.enabled && config.health_check.interval_ms == 0 {
        errors.push(ValidationError::NonPositive { field: "health_check.interval_ms" });
    }

    if config.pool.min_idle > config.pool.max_size {
        errors.push(ValidationError::PoolBounds {
            min_idle: config.pool.min_idle,
            max_size: config.pool.max_size,
        });
    }

    let multiplier = config.circuit_breaker.backoff_multiplier;
    if !multiplier.is_finite() || multiplier < 1.0 {
        errors.push(ValidationError::BackoffMultiplier(multiplier.to_string()));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_endpoint(backend: &BackendConfig) -> Result<(), String> {
    if backend.endpoint.trim().is_empty() {
        return Err("endpoint is empty".to_string());
    }

    let allowed: &[&str] = match backend.transport {
        TransportKind::Stdio => return Ok(()),
        // Backend clients are plaintext; terminate TLS in front of the backend.
        TransportKind::Http | TransportKind::Sse => &["http"],
        TransportKind::Websocket => &["ws"],
    };

    let url = Url::parse(&backend.endpoint).map_err(|e| format!("invalid URL: {}", e))?;
    if !allowed.contains(&url.scheme()) {
        return Err(format!(
            "scheme '{}' does not match transport {}",
            url.scheme(),
            backend.transport
        ));
    }
    Ok(())
}
