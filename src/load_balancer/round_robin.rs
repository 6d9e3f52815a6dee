//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::load_balancer::backend::BackendId;
use crate::load_balancer::{Algorithm, Balancer, DispatchError, SelectionContext};

/// Round-robin selector.
/// Stores an internal counter to rotate through the healthy subset.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for RoundRobin {
    fn select(&self, ctx: &SelectionContext<'_>) -> Result<BackendId, DispatchError> {
        let healthy = ctx.healthy();
        if healthy.is_empty() {
            return Err(DispatchError::NoHealthyBackend);
        }

        // Taken modulo the subset size at selection time, so a shrinking
        // subset can never push the cursor out of range.
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Ok(healthy[index].id)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::RoundRobin
    }
}
