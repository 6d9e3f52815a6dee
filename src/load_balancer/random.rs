//! Uniform random selection. Stateless.

use rand::Rng;

use crate::load_balancer::backend::BackendId;
use crate::load_balancer::{Algorithm, Balancer, DispatchError, SelectionContext};

#[derive(Debug, Default)]
pub struct RandomPick;

impl RandomPick {
    pub fn new() -> Self {
        Self
    }
}

impl Balancer for RandomPick {
    fn select(&self, ctx: &SelectionContext<'_>) -> Result<BackendId, DispatchError> {
        let healthy = ctx.healthy();
        if healthy.is_empty() {
            return Err(DispatchError::NoHealthyBackend);
        }
        let index = rand::thread_rng().gen_range(0..healthy.len());
        Ok(healthy[index].id)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::Random
    }
}
