//! Smooth weighted round-robin.
//!
//! Every pick adds each backend's weight to its running score, selects the
//! highest score and subtracts the total weight from the winner. Over one
//! cycle of `sum(weights)` picks each backend is chosen `weight` times, and
//! heavy backends are spread out instead of picked back to back.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::load_balancer::backend::BackendId;
use crate::load_balancer::{Algorithm, Balancer, DispatchError, SelectionContext};

#[derive(Debug, Default)]
pub struct WeightedRoundRobin {
    current: Mutex<HashMap<BackendId, i64>>,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for WeightedRoundRobin {
    fn select(&self, ctx: &SelectionContext<'_>) -> Result<BackendId, DispatchError> {
        let healthy = ctx.healthy();
        if healthy.is_empty() {
            return Err(DispatchError::NoHealthyBackend);
        }

        let mut current = self.current.lock();

        // Scores of backends that left the subset would skew the cycle.
        let present: HashSet<BackendId> = healthy.iter().map(|b| b.id).collect();
        current.retain(|id, _| present.contains(id));

        let total: i64 = healthy.iter().map(|b| i64::from(b.weight.max(1))).sum();
        let mut best: Option<(BackendId, i64)> = None;

        for backend in healthy {
            let score = current.entry(backend.id).or_insert(0);
            *score += i64::from(backend.weight.max(1));
            // Strict comparison keeps ties on the earliest backend in pool order.
            if best.map_or(true, |(_, top)| *score > top) {
                best = Some((backend.id, *score));
            }
        }

        let (id, _) = best.ok_or(DispatchError::NoHealthyBackend)?;
        if let Some(score) = current.get_mut(&id) {
            *score -= total;
        }
        Ok(id)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::WeightedRoundRobin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::test_support::healthy;

    #[test]
    fn test_weights_three_to_one_interleaved() {
        let lb = WeightedRoundRobin::new();
        let ctx = SelectionContext::new(1, 1, vec![healthy(1, 8080, 3), healthy(2, 8081, 1)], "");

        let picks: Vec<_> = (0..4).map(|_| lb.select(&ctx).unwrap()).collect();

        assert_eq!(picks.iter().filter(|id| **id == BackendId(1)).count(), 3);
        assert_eq!(picks.iter().filter(|id| **id == BackendId(2)).count(), 1);
        assert!(
            !picks.windows(3).any(|w| w.iter().all(|id| *id == BackendId(1))),
            "heavy backend picked three times in a row: {:?}",
            picks
        );
    }

    #[test]
    fn test_cycle_matches_weights() {
        let lb = WeightedRoundRobin::new();
        let ctx = SelectionContext::new(
            1,
            1,
            vec![healthy(1, 8080, 5), healthy(2, 8081, 2), healthy(3, 8082, 1)],
            "",
        );

        let mut counts: HashMap<BackendId, usize> = HashMap::new();
        for _ in 0..16 {
            *counts.entry(lb.select(&ctx).unwrap()).or_default() += 1;
        }

        assert_eq!(counts[&BackendId(1)], 10);
        assert_eq!(counts[&BackendId(2)], 4);
        assert_eq!(counts[&BackendId(3)], 2);
    }

    #[test]
    fn test_removed_backend_state_dropped() {
        let lb = WeightedRoundRobin::new();
        let both = SelectionContext::new(1, 1, vec![healthy(1, 8080, 1), healthy(2, 8081, 1)], "");
        lb.select(&both).unwrap();

        let only_second = SelectionContext::new(2, 2, vec![healthy(2, 8081, 1)], "");
        assert_eq!(lb.select(&only_second).unwrap(), BackendId(2));
        assert!(!lb.current.lock().contains_key(&BackendId(1)));
    }
}
