//! Least Connections load balancing strategy.

use crate::load_balancer::backend::BackendId;
use crate::load_balancer::{Algorithm, Balancer, DispatchError, SelectionContext};

/// Least connections selector.
/// Selects the backend with the minimum number of in-flight requests.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl Balancer for LeastConnections {
    fn select(&self, ctx: &SelectionContext<'_>) -> Result<BackendId, DispatchError> {
        // min_by_key returns the first minimum, so ties go to pool order.
        ctx.healthy()
            .iter()
            .min_by_key(|b| b.connections)
            .map(|b| b.id)
            .ok_or(DispatchError::NoHealthyBackend)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::LeastConnections
    }
}
