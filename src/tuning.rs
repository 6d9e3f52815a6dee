//! Runtime-tunable engine parameters.
//!
//! One `Tuning` value is shared by the registry (hysteresis thresholds), the
//! health checker (interval, timeout) and the dispatcher (algorithm). It is
//! replaced as a whole, so a reconfiguration is observed atomically by each
//! component on its next selection or probe cycle.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use crate::health::state::Hysteresis;
use crate::load_balancer::{Algorithm, DispatchError};

/// Handle shared between engine components.
pub type SharedTuning = Arc<ArcSwap<Tuning>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuning {
    pub algorithm: Algorithm,
    pub health_interval: Duration,
    pub health_timeout: Duration,
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::RoundRobin,
            health_interval: Duration::from_secs(10),
            health_timeout: Duration::from_secs(2),
            failure_threshold: 3,
            success_threshold: 2,
        }
    }
}

impl Tuning {
    pub fn hysteresis(&self) -> Hysteresis {
        Hysteresis {
            failure_threshold: self.failure_threshold,
            success_threshold: self.success_threshold,
        }
    }

    /// Reject values that would stall probing or disable hysteresis.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.failure_threshold == 0 || self.success_threshold == 0 {
            return Err(DispatchError::InvalidConfiguration(
                "health thresholds must be at least 1".into(),
            ));
        }
        if self.health_interval.is_zero() {
            return Err(DispatchError::InvalidConfiguration(
                "health interval must be positive".into(),
            ));
        }
        if self.health_timeout.is_zero() {
            return Err(DispatchError::InvalidConfiguration(
                "health timeout must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn shared(self) -> SharedTuning {
        Arc::new(ArcSwap::from_pointee(self))
    }
}
