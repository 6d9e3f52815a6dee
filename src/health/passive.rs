//! Passive health checking (failure detection).
//!
//! # Responsibilities
//! - Observe request outcomes reported by the dispatcher
//! - Feed them into the same hysteresis state machine as active probes
//!
//! # Design Decisions
//! - Only connection errors, timeouts and 502/503/504 count as failures
//! - 4xx are NOT failures (client error, not backend)
//! - Other 5xx prove the backend is up, but the request still failed, so
//!   they do not pin a sticky session
//! - Thresholds are configured separately and fall back to the active ones

use std::time::Duration;

use crate::health::state::{HealthCheckResult, Hysteresis};

/// Outcome of one forwarded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success { latency: Duration },
    /// The backend answered with a 5xx other than 502/503/504.
    ServerError { latency: Duration },
    Failure,
    Timeout,
}

impl RequestOutcome {
    /// Classify an upstream HTTP status.
    pub fn from_status(status: u16, latency: Duration) -> Self {
        match status {
            502..=504 => RequestOutcome::Failure,
            500..=599 => RequestOutcome::ServerError { latency },
            _ => RequestOutcome::Success { latency },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RequestOutcome::Success { .. })
    }

    pub fn to_result(self) -> HealthCheckResult {
        match self {
            RequestOutcome::Success { latency } | RequestOutcome::ServerError { latency } => {
                HealthCheckResult::success(Some(latency))
            }
            RequestOutcome::Failure | RequestOutcome::Timeout => HealthCheckResult::failure(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RequestOutcome::Success { .. } => "success",
            RequestOutcome::ServerError { .. } => "server_error",
            RequestOutcome::Failure => "failure",
            RequestOutcome::Timeout => "timeout",
        }
    }
}

/// How request outcomes feed health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PassivePolicy {
    pub enabled: bool,
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
}

impl PassivePolicy {
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Thresholds to apply, overriding `active` where configured.
    pub fn hysteresis(&self, active: Hysteresis) -> Hysteresis {
        Hysteresis {
            failure_threshold: self.failure_threshold.unwrap_or(active.failure_threshold),
            success_threshold: self.success_threshold.unwrap_or(active.success_threshold),
        }
    }
}
