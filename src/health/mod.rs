//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     One task per backend, own timer
//!     → probe.rs (TCP connect or HTTP GET, bounded timeout)
//!     → registry.mark_result
//!
//! Passive health checks (passive.rs):
//!     Request outcome reported by the dispatcher
//!     → registry.mark_result_with (passive thresholds)
//!
//! State machine (state.rs):
//!     Healthy ←→ Unhealthy
//!     With thresholds to prevent flapping
//! ```
//!
//! # Design Decisions
//! - Active and passive checks are complementary
//! - State transitions require consecutive successes/failures
//! - A slow probe only ever delays its own backend

pub mod active;
pub mod passive;
pub mod probe;
pub mod state;

pub use active::HealthChecker;
pub use passive::{PassivePolicy, RequestOutcome};
pub use probe::ProbeKind;
pub use state::{HealthCheckResult, Hysteresis};
