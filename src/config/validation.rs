//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds, intervals, weights, ports)
//! - Detect duplicate backend identities within a pool
//! - Keep service names and Host mappings unambiguous
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: DispatchConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use crate::config::schema::{BackendConfig, DispatchConfig};
use crate::routing::{normalize_host, DEFAULT_POOL};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &DispatchConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.admin.enabled {
        if config.admin.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::new(
                "admin.bind_address",
                format!("'{}' is not a socket address", config.admin.bind_address),
            ));
        }
        if config.admin.api_key.is_empty() {
            errors.push(ValidationError::new("admin.api_key", "must not be empty"));
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

    let health = &config.health_check;
    if health.interval_secs == 0 {
        errors.push(ValidationError::new("health_check.interval_secs", "must be at least 1"));
    }
    if health.timeout_ms == 0 {
        errors.push(ValidationError::new("health_check.timeout_ms", "must be at least 1"));
    } else if health.interval_secs > 0
        && Duration::from_millis(health.timeout_ms) >= Duration::from_secs(health.interval_secs)
    {
        errors.push(ValidationError::new(
            "health_check.timeout_ms",
            "must be shorter than the probe interval",
        ));
    }
    if health.unhealthy_threshold == 0 {
        errors.push(ValidationError::new("health_check.unhealthy_threshold", "must be at least 1"));
    }
    if health.healthy_threshold == 0 {
        errors.push(ValidationError::new("health_check.healthy_threshold", "must be at least 1"));
    }
    if !health.path.starts_with('/') {
        errors.push(ValidationError::new("health_check.path", "must start with '/'"));
    }

    if config.passive_health.failure_threshold == Some(0) {
        errors.push(ValidationError::new("passive_health.failure_threshold", "must be at least 1"));
    }
    if config.passive_health.success_threshold == Some(0) {
        errors.push(ValidationError::new("passive_health.success_threshold", "must be at least 1"));
    }

    if config.balancing.sticky_sessions && config.balancing.sticky_ttl_secs == 0 {
        errors.push(ValidationError::new("balancing.sticky_ttl_secs", "must be at least 1"));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be at least 1"));
    }

    check_backends("backends", &config.backends, &mut errors);

    let mut names = HashSet::new();
    let mut hosts = HashSet::new();
    for (i, service) in config.services.iter().enumerate() {
        let field = format!("services[{}]", i);
        let name = service.name.trim();
        if name.is_empty() {
            errors.push(ValidationError::new(format!("{}.name", field), "must not be empty"));
        } else if name.eq_ignore_ascii_case(DEFAULT_POOL) {
            errors.push(ValidationError::new(
                format!("{}.name", field),
                format!("'{}' is reserved for the default pool", DEFAULT_POOL),
            ));
        } else if !names.insert(name.to_ascii_lowercase()) {
            errors.push(ValidationError::new(
                format!("{}.name", field),
                format!("duplicate service '{}'", name),
            ));
        }

        if service.hosts.is_empty() {
            errors.push(ValidationError::new(format!("{}.hosts", field), "must list at least one host"));
        }
        for host in &service.hosts {
            let normalized = normalize_host(host);
            if normalized.is_empty() {
                errors.push(ValidationError::new(format!("{}.hosts", field), "host must not be empty"));
            } else if !hosts.insert(normalized) {
                errors.push(ValidationError::new(
                    format!("{}.hosts", field),
                    format!("host '{}' is already mapped to another service", host),
                ));
            }
        }

        check_backends(&format!("{}.backends", field), &service.backends, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_backends(prefix: &str, backends: &[BackendConfig], errors: &mut Vec<ValidationError>) {
    let mut seen = HashSet::new();
    for (i, backend) in backends.iter().enumerate() {
        let field = format!("{}[{}]", prefix, i);
        if backend.host.trim().is_empty() {
            errors.push(ValidationError::new(&field, "host must not be empty"));
        }
        if backend.port == 0 {
            errors.push(ValidationError::new(&field, "port must be non-zero"));
        }
        if backend.weight == 0 {
            errors.push(ValidationError::new(&field, "weight must be at least 1"));
        }
        if !seen.insert((backend.host.to_ascii_lowercase(), backend.port)) {
            errors.push(ValidationError::new(
                &field,
                format!("duplicate backend {}:{}", backend.host, backend.port),
            ));
        }
    }
}
