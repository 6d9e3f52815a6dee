//! Backend health state machine.
//!
//! # State Transitions
//! ```text
//! Healthy → Unhealthy: consecutive failures >= failure_threshold
//! Unhealthy → Healthy: consecutive successes >= success_threshold
//! ```
//!
//! Counters reset on every transition. The drain flag is not touched here;
//! a draining backend keeps moving between Healthy and Unhealthy underneath
//! so it can be handed back to selection as soon as it is undrained.

use std::time::{Duration, SystemTime};

use crate::load_balancer::backend::{Backend, HealthState};

/// Consecutive-signal thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hysteresis {
    pub failure_threshold: u32,
    pub success_threshold: u32,
}

impl Default for Hysteresis {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    Success,
    Failure,
}

/// Result of one active probe or one passively observed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthCheckResult {
    pub outcome: CheckOutcome,
    pub at: SystemTime,
    pub latency: Option<Duration>,
}

impl HealthCheckResult {
    pub fn success(latency: Option<Duration>) -> Self {
        Self {
            outcome: CheckOutcome::Success,
            at: SystemTime::now(),
            latency,
        }
    }

    pub fn failure() -> Self {
        Self {
            outcome: CheckOutcome::Failure,
            at: SystemTime::now(),
            latency: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == CheckOutcome::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    BecameHealthy,
    BecameUnhealthy,
}

/// Fold one result into the backend's counters, flipping health when a
/// threshold is reached.
pub fn apply(backend: &mut Backend, result: &HealthCheckResult, hysteresis: &Hysteresis) -> Transition {
    backend.last_check = Some(result.at);

    match result.outcome {
        CheckOutcome::Success => {
            backend.consecutive_failures = 0;
            backend.consecutive_successes = backend.consecutive_successes.saturating_add(1);

            if backend.health == HealthState::Unhealthy
                && backend.consecutive_successes >= hysteresis.success_threshold
            {
                backend.health = HealthState::Healthy;
                backend.consecutive_successes = 0;
                return Transition::BecameHealthy;
            }
        }
        CheckOutcome::Failure => {
            backend.consecutive_successes = 0;
            backend.consecutive_failures = backend.consecutive_failures.saturating_add(1);

            if backend.health == HealthState::Healthy
                && backend.consecutive_failures >= hysteresis.failure_threshold
            {
                backend.health = HealthState::Unhealthy;
                backend.consecutive_failures = 0;
                return Transition::BecameUnhealthy;
            }
        }
    }

    Transition::Unchanged
}
