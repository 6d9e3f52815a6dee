//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single backend server as an immutable record
//! - Carry the in-flight connection count used by Least Connections
//! - Carry probe-driven health, the drain flag and hysteresis counters
//!
//! A `Backend` is only ever mutated by the registry, which builds a fresh
//! copy and publishes it inside a new pool. Everything else sees it through
//! an `Arc` taken from a snapshot.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Registry-assigned backend identifier. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(pub u64);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Probe-driven health, independent of the drain flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

/// Status as reported to selection and to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Draining,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Draining => "draining",
        };
        f.write_str(s)
    }
}

/// Identity and weight of a backend as supplied at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSpec {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl BackendSpec {
    pub fn new(host: impl Into<String>, port: u16, weight: u32) -> Self {
        Self {
            host: host.into(),
            port,
            weight,
        }
    }
}

/// A single backend server.
#[derive(Debug, Clone)]
pub struct Backend {
    pub id: BackendId,
    pub host: String,
    pub port: u16,
    /// Relative share for weighted selection. Always >= 1.
    pub weight: u32,
    /// Number of in-flight requests routed to this backend.
    pub connections: u64,
    pub health: HealthState,
    /// Administrative override; excluded from selection while set.
    pub draining: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_check: Option<SystemTime>,
}

impl Backend {
    /// Create a backend in the fail-safe initial state (unhealthy until probed).
    pub fn new(id: BackendId, spec: BackendSpec) -> Self {
        Self {
            id,
            host: spec.host,
            port: spec.port,
            weight: spec.weight,
            connections: 0,
            health: HealthState::Unhealthy,
            draining: false,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_check: None,
        }
    }

    pub fn status(&self) -> HealthStatus {
        if self.draining {
            return HealthStatus::Draining;
        }
        match self.health {
            HealthState::Healthy => HealthStatus::Healthy,
            HealthState::Unhealthy => HealthStatus::Unhealthy,
        }
    }

    /// True when the backend belongs to the healthy subset.
    pub fn is_selectable(&self) -> bool {
        self.status() == HealthStatus::Healthy
    }

    /// `host:port`, suitable for connecting and for log fields.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn same_identity(&self, host: &str, port: u16) -> bool {
        self.port == port && self.host.eq_ignore_ascii_case(host)
    }
}
