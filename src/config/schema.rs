//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from TOML files, and
//! every section has defaults so a minimal file (or none) is enough.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::health::passive::PassivePolicy;
use crate::health::probe::ProbeKind;
use crate::load_balancer::backend::BackendSpec;
use crate::load_balancer::Algorithm;
use crate::tuning::Tuning;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Proxy listener (where client traffic arrives).
    pub listener: ListenerConfig,

    /// Admin API.
    pub admin: AdminConfig,

    /// Selection algorithm and session affinity.
    pub balancing: BalancingConfig,

    /// Active health check settings.
    pub health_check: HealthCheckConfig,

    /// Request-outcome driven health feedback.
    pub passive_health: PassiveHealthConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Backends of the default pool, registered at startup.
    pub backends: Vec<BackendConfig>,

    /// Named pools selected by the request's Host header.
    pub services: Vec<ServiceConfig>,
}

impl DispatchConfig {
    /// Runtime-tunable subset.
    pub fn tuning(&self) -> Tuning {
        Tuning {
            algorithm: self.balancing.algorithm,
            health_interval: Duration::from_secs(self.health_check.interval_secs),
            health_timeout: Duration::from_millis(self.health_check.timeout_ms),
            failure_threshold: self.health_check.unhealthy_threshold,
            success_threshold: self.health_check.healthy_threshold,
        }
    }

    /// Configuration of one service pool: this file's settings with the
    /// service's overrides and backends in place of the default pool's.
    pub fn for_service(&self, service: &ServiceConfig) -> DispatchConfig {
        let mut config = self.clone();
        if let Some(algorithm) = service.algorithm {
            config.balancing.algorithm = algorithm;
        }
        if let Some(sticky) = service.sticky_sessions {
            config.balancing.sticky_sessions = sticky;
        }
        config.backends = service.backends.clone();
        config.services = Vec::new();
        config
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BalancingConfig {
    pub algorithm: Algorithm,

    /// Route a client key back to the backend that last served it.
    pub sticky_sessions: bool,

    /// Idle lifetime of a sticky binding in seconds.
    pub sticky_ttl_secs: u64,
}

impl Default for BalancingConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::RoundRobin,
            sticky_sessions: false,
            sticky_ttl_secs: 300,
        }
    }
}

impl BalancingConfig {
    pub fn sticky_ttl(&self) -> Duration {
        Duration::from_secs(self.sticky_ttl_secs)
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    #[default]
    Tcp,
    Http,
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Health check interval in seconds.
    pub interval_secs: u64,

    /// Health check timeout in milliseconds.
    pub timeout_ms: u64,

    /// TCP connect or HTTP GET.
    pub probe: ProbeMode,

    /// Path to probe for HTTP health checks.
    pub path: String,

    /// Number of consecutive failures before marking unhealthy.
    pub unhealthy_threshold: u32,

    /// Number of consecutive successes before marking healthy.
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            timeout_ms: 2000,
            probe: ProbeMode::Tcp,
            path: "/health".to_string(),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

impl HealthCheckConfig {
    pub fn probe_kind(&self) -> ProbeKind {
        match self.probe {
            ProbeMode::Tcp => ProbeKind::Tcp,
            ProbeMode::Http => ProbeKind::Http {
                path: self.path.clone(),
            },
        }
    }
}

/// Passive health configuration.
///
/// Thresholds left unset fall back to the active ones.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PassiveHealthConfig {
    pub enabled: bool,
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
}

impl Default for PassiveHealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: None,
            success_threshold: None,
        }
    }
}

impl PassiveHealthConfig {
    pub fn policy(&self) -> PassivePolicy {
        PassivePolicy {
            enabled: self.enabled,
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Request timeout (total time for upstream request/response) in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { request_secs: 30 }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Backend server configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,

    /// Weight for weighted load balancing (default: 1).
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl BackendConfig {
    pub fn spec(&self) -> BackendSpec {
        BackendSpec::new(self.host.clone(), self.port, self.weight)
    }
}

/// A named backend pool, chosen for requests whose Host header matches one
/// of `hosts`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServiceConfig {
    pub name: String,

    /// Host header values (case-insensitive, port ignored).
    pub hosts: Vec<String>,

    /// Overrides `balancing.algorithm` for this pool.
    #[serde(default)]
    pub algorithm: Option<Algorithm>,

    /// Overrides `balancing.sticky_sessions` for this pool.
    #[serde(default)]
    pub sticky_sessions: Option<bool>,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}
