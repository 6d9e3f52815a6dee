//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatcher::route(key)
//!     → registry.rs (lock-free pool snapshot)
//!     → SelectionContext (healthy subset + pool version)
//!     → sticky.rs (optional session affinity)
//!     → Apply load balancing algorithm:
//!         - round_robin.rs (rotate through backends)
//!         - weighted.rs (smooth weighted interleaving)
//!         - least_conn.rs (pick backend with fewest connections)
//!         - consistent_hash.rs (hash ring over request key)
//!         - random.rs (uniform pick)
//!     → registry.rs (count the new connection)
//!     → Return BackendId or NoHealthyBackend
//! ```
//!
//! # Design Decisions
//! - The registry is the only shared mutable state
//! - Algorithms never read the registry; they see a snapshot
//! - Unhealthy and draining backends never reach an algorithm

pub mod backend;
pub mod consistent_hash;
pub mod dispatcher;
pub mod least_conn;
pub mod random;
pub mod registry;
pub mod round_robin;
pub mod sticky;
pub mod weighted;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use self::backend::{Backend, BackendId};
use self::registry::Pool;

pub use self::dispatcher::{Dispatcher, RouteLease};
pub use self::registry::BackendRegistry;

/// Errors surfaced by the dispatch core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("backend {host}:{port} is already registered")]
    DuplicateBackend { host: String, port: u16 },

    #[error("no healthy backend available")]
    NoHealthyBackend,

    #[error("invalid backend: {0}")]
    InvalidBackend(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Selection algorithm tag, as named in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    ConsistentHash,
    Random,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "round_robin",
            Algorithm::WeightedRoundRobin => "weighted_round_robin",
            Algorithm::LeastConnections => "least_connections",
            Algorithm::ConsistentHash => "consistent_hash",
            Algorithm::Random => "random",
        }
    }

    /// Fresh balancer with empty cursor state.
    pub fn build(self) -> Arc<dyn Balancer> {
        match self {
            Algorithm::RoundRobin => Arc::new(round_robin::RoundRobin::new()),
            Algorithm::WeightedRoundRobin => Arc::new(weighted::WeightedRoundRobin::new()),
            Algorithm::LeastConnections => Arc::new(least_conn::LeastConnections::new()),
            Algorithm::ConsistentHash => Arc::new(consistent_hash::ConsistentHash::new()),
            Algorithm::Random => Arc::new(random::RandomPick::new()),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Algorithm::RoundRobin),
            "weighted_round_robin" => Ok(Algorithm::WeightedRoundRobin),
            "least_connections" => Ok(Algorithm::LeastConnections),
            "consistent_hash" => Ok(Algorithm::ConsistentHash),
            "random" => Ok(Algorithm::Random),
            other => Err(DispatchError::InvalidConfiguration(format!(
                "unknown algorithm '{}'",
                other
            ))),
        }
    }
}

/// Immutable per-request view handed to a balancer.
///
/// Built from exactly one pool snapshot; `version` and `epoch` identify it.
#[derive(Debug, Clone)]
pub struct SelectionContext<'a> {
    version: u64,
    epoch: u64,
    healthy: Vec<Arc<Backend>>,
    key: &'a str,
}

impl<'a> SelectionContext<'a> {
    pub fn from_pool(pool: &Pool, key: &'a str) -> Self {
        Self {
            version: pool.version(),
            epoch: pool.epoch(),
            healthy: pool.healthy(),
            key,
        }
    }

    pub fn new(version: u64, epoch: u64, healthy: Vec<Arc<Backend>>, key: &'a str) -> Self {
        Self {
            version,
            epoch,
            healthy,
            key,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn healthy(&self) -> &[Arc<Backend>] {
        &self.healthy
    }

    pub fn key(&self) -> &str {
        self.key
    }

    pub fn is_empty(&self) -> bool {
        self.healthy.is_empty()
    }

    pub fn find(&self, id: BackendId) -> Option<&Arc<Backend>> {
        self.healthy.iter().find(|b| b.id == id)
    }
}

/// A selection strategy.
///
/// Implementations may keep cursor state across calls but must not reach
/// outside the context they are given.
pub trait Balancer: Send + Sync + fmt::Debug {
    fn select(&self, ctx: &SelectionContext<'_>) -> Result<BackendId, DispatchError>;

    fn algorithm(&self) -> Algorithm;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_names_round_trip_through_from_str() {
        for algo in [
            Algorithm::RoundRobin,
            Algorithm::WeightedRoundRobin,
            Algorithm::LeastConnections,
            Algorithm::ConsistentHash,
            Algorithm::Random,
        ] {
            assert_eq!(algo.as_str().parse::<Algorithm>().unwrap(), algo);
            assert_eq!(algo.build().algorithm(), algo);
        }
        assert!("ip_hash".parse::<Algorithm>().is_err());
    }

    #[test]
    fn test_empty_context_fails_for_every_algorithm() {
        let ctx = SelectionContext::new(1, 1, Vec::new(), "client");
        for algo in [
            Algorithm::RoundRobin,
            Algorithm::WeightedRoundRobin,
            Algorithm::LeastConnections,
            Algorithm::ConsistentHash,
            Algorithm::Random,
        ] {
            assert_eq!(
                algo.build().select(&ctx),
                Err(DispatchError::NoHealthyBackend),
                "{} should fail on empty subset",
                algo
            );
        }
    }
}
