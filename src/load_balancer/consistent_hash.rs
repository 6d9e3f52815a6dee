//! Consistent hashing over the healthy subset.
//!
//! Each healthy backend is placed on the ring at `VIRTUAL_NODES` points
//! derived from its `host:port` identity. A request key hashes to a point and
//! is served by the first backend clockwise from it. When a backend leaves,
//! only the keys that landed on its points move.
//!
//! The ring is cached and rebuilt only when the pool's membership epoch
//! changes, not per request.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::load_balancer::backend::BackendId;
use crate::load_balancer::{Algorithm, Balancer, DispatchError, SelectionContext};

/// Number of virtual nodes per backend (for better distribution).
const VIRTUAL_NODES: usize = 150;

#[derive(Debug)]
struct HashRing {
    epoch: u64,
    points: BTreeMap<u64, BackendId>,
}

impl HashRing {
    fn build(ctx: &SelectionContext<'_>) -> Self {
        let mut points = BTreeMap::new();
        for backend in ctx.healthy() {
            let identity = backend.address().to_ascii_lowercase();
            for i in 0..VIRTUAL_NODES {
                points.insert(hash_point(&format!("{}#{}", identity, i)), backend.id);
            }
        }
        Self {
            epoch: ctx.epoch(),
            points,
        }
    }

    fn lookup(&self, key: &str) -> Option<BackendId> {
        let point = hash_point(key);
        self.points
            .range(point..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, id)| *id)
    }
}

fn hash_point(value: &str) -> u64 {
    let digest = blake3::hash(value.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

#[derive(Debug, Default)]
pub struct ConsistentHash {
    ring: RwLock<Option<Arc<HashRing>>>,
}

impl ConsistentHash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ring matching the context's epoch, reusing the cached one if it fits.
    fn ring_for(&self, ctx: &SelectionContext<'_>) -> Arc<HashRing> {
        if let Some(ring) = self.ring.read().as_ref() {
            if ring.epoch == ctx.epoch() {
                return ring.clone();
            }
        }

        let ring = Arc::new(HashRing::build(ctx));
        let mut cached = self.ring.write();
        // An older context must not evict a newer ring.
        if cached.as_ref().map_or(true, |r| r.epoch < ring.epoch) {
            *cached = Some(ring.clone());
        }
        ring
    }
}

impl Balancer for ConsistentHash {
    fn select(&self, ctx: &SelectionContext<'_>) -> Result<BackendId, DispatchError> {
        if ctx.is_empty() {
            return Err(DispatchError::NoHealthyBackend);
        }
        self.ring_for(ctx)
            .lookup(ctx.key())
            .ok_or(DispatchError::NoHealthyBackend)
    }

    fn algorithm(&self) -> Algorithm {
        Algorithm::ConsistentHash
    }
}
