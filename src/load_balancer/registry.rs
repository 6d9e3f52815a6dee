//! Backend registry.
//!
//! # Responsibilities
//! - Own the pool of registered backends (single source of truth)
//! - Apply health results through the hysteresis state machine
//! - Track in-flight connections for Least Connections
//! - Publish version-stamped, immutable snapshots to readers
//!
//! # Design Decisions
//! - Copy-on-write: every mutation builds a new `Pool` and publishes it with
//!   compare-and-swap, so readers never wait on writers
//! - Writers retry on contention instead of taking a global lock
//! - Unknown ids are a no-op everywhere (races with deregistration)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use tokio::sync::watch;

use crate::health::state::{self, HealthCheckResult, Hysteresis, Transition};
use crate::load_balancer::backend::{Backend, BackendId, BackendSpec, HealthState};
use crate::load_balancer::DispatchError;
use crate::observability::metrics;
use crate::tuning::{SharedTuning, Tuning};

/// Immutable, version-stamped set of backends.
#[derive(Debug, Clone, Default)]
pub struct Pool {
    /// Bumped by every state-changing mutation.
    version: u64,
    /// Bumped only when the selectable set or membership changes.
    epoch: u64,
    backends: Vec<Arc<Backend>>,
}

impl Pool {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    pub fn get(&self, id: BackendId) -> Option<&Arc<Backend>> {
        self.backends.iter().find(|b| b.id == id)
    }

    /// Backends eligible for selection, in pool order.
    pub fn healthy(&self) -> Vec<Arc<Backend>> {
        self.backends
            .iter()
            .filter(|b| b.is_selectable())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Backend registered under `host:port`, if any.
    pub fn find_identity(&self, host: &str, port: u16) -> Option<&Arc<Backend>> {
        self.backends.iter().find(|b| b.same_identity(host, port))
    }

    fn position(&self, id: BackendId) -> Option<usize> {
        self.backends.iter().position(|b| b.id == id)
    }

    /// Copy of this pool with one backend replaced.
    fn with_replaced(&self, index: usize, backend: Backend, selectable_changed: bool) -> Pool {
        let mut backends = self.backends.clone();
        backends[index] = Arc::new(backend);
        Pool {
            version: self.version + 1,
            epoch: self.epoch + u64::from(selectable_changed),
            backends,
        }
    }
}

enum Commit<R> {
    Unchanged(R),
    Replace(Pool, R),
}

/// Thread-safe owner of the backend pool.
#[derive(Debug)]
pub struct BackendRegistry {
    pool: ArcSwap<Pool>,
    next_id: AtomicU64,
    tuning: SharedTuning,
    membership: watch::Sender<u64>,
    initial_health: HealthState,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRegistry {
    /// Registry with default thresholds.
    pub fn new() -> Self {
        Self::with_tuning(Tuning::default().shared())
    }

    /// Registry reading its hysteresis thresholds from shared tuning.
    pub fn with_tuning(tuning: SharedTuning) -> Self {
        let (membership, _) = watch::channel(0);
        Self {
            pool: ArcSwap::from_pointee(Pool::default()),
            next_id: AtomicU64::new(1),
            tuning,
            membership,
            initial_health: HealthState::Unhealthy,
        }
    }

    /// Register new backends as healthy. For deployments without active
    /// probing, where nothing would ever confirm them.
    pub fn assume_healthy(mut self) -> Self {
        self.initial_health = HealthState::Healthy;
        self
    }

    /// Current pool. Lock-free; the returned snapshot never changes.
    pub fn snapshot(&self) -> Arc<Pool> {
        self.pool.load_full()
    }

    pub fn version(&self) -> u64 {
        self.pool.load().version
    }

    pub fn epoch(&self) -> u64 {
        self.pool.load().epoch
    }

    /// Default hysteresis, as currently tuned.
    pub fn hysteresis(&self) -> Hysteresis {
        self.tuning.load().hysteresis()
    }

    /// Receiver notified with the new epoch whenever membership or the
    /// selectable set changes.
    pub fn subscribe_membership(&self) -> watch::Receiver<u64> {
        self.membership.subscribe()
    }

    /// Add a backend. It starts unhealthy until probes confirm it, unless
    /// the registry was built with [`BackendRegistry::assume_healthy`].
    pub fn register(&self, spec: BackendSpec) -> Result<BackendId, DispatchError> {
        validate_spec(&spec)?;
        let id = BackendId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let result = self.commit(|pool| {
            if pool.backends.iter().any(|b| b.same_identity(&spec.host, spec.port)) {
                return Commit::Unchanged(Err(DispatchError::DuplicateBackend {
                    host: spec.host.clone(),
                    port: spec.port,
                }));
            }
            let mut backends = pool.backends.clone();
            let mut backend = Backend::new(id, spec.clone());
            backend.health = self.initial_health;
            backends.push(Arc::new(backend));
            Commit::Replace(
                Pool {
                    version: pool.version + 1,
                    epoch: pool.epoch + 1,
                    backends,
                },
                Ok(id),
            )
        });

        if result.is_ok() {
            tracing::info!(
                backend_id = %id,
                addr = %format!("{}:{}", spec.host, spec.port),
                weight = spec.weight,
                "Backend registered"
            );
        }
        result
    }

    /// Remove a backend. Returns false when it was not present.
    pub fn deregister(&self, id: BackendId) -> bool {
        let removed = self.commit(|pool| match pool.position(id) {
            None => Commit::Unchanged(None),
            Some(index) => {
                let mut backends = pool.backends.clone();
                let removed = backends.remove(index);
                Commit::Replace(
                    Pool {
                        version: pool.version + 1,
                        epoch: pool.epoch + 1,
                        backends,
                    },
                    Some(removed),
                )
            }
        });

        match removed {
            Some(backend) => {
                tracing::info!(
                    backend_id = %id,
                    addr = %backend.address(),
                    in_flight = backend.connections,
                    "Backend deregistered"
                );
                true
            }
            None => false,
        }
    }

    /// Apply a result using the default thresholds.
    ///
    /// Returns `None` when the id is unknown.
    pub fn mark_result(&self, id: BackendId, result: &HealthCheckResult) -> Option<Transition> {
        let hysteresis = self.hysteresis();
        self.mark_result_with(id, result, &hysteresis)
    }

    /// Apply a result using explicit thresholds (passive feedback).
    pub fn mark_result_with(
        &self,
        id: BackendId,
        result: &HealthCheckResult,
        hysteresis: &Hysteresis,
    ) -> Option<Transition> {
        let outcome = self.commit(|pool| {
            let Some(index) = pool.position(id) else {
                return Commit::Unchanged(None);
            };
            let current = &pool.backends[index];
            let mut next = (**current).clone();
            let transition = state::apply(&mut next, result, hysteresis);
            let selectable_changed = next.is_selectable() != current.is_selectable();
            let address = next.address();
            Commit::Replace(
                pool.with_replaced(index, next, selectable_changed),
                Some((transition, address)),
            )
        });

        let (transition, address) = outcome?;
        match transition {
            Transition::BecameHealthy => {
                tracing::info!(backend_id = %id, addr = %address, "Backend transitioned to healthy");
                metrics::record_backend_health(&address, true);
            }
            Transition::BecameUnhealthy => {
                tracing::warn!(backend_id = %id, addr = %address, "Backend transitioned to unhealthy");
                metrics::record_backend_health(&address, false);
            }
            Transition::Unchanged => {}
        }
        Some(transition)
    }

    /// Add `delta` to the in-flight count, clamping at zero.
    ///
    /// Returns false when the id is unknown.
    pub fn adjust_connections(&self, id: BackendId, delta: i64) -> bool {
        let updated = self.commit(|pool| {
            let Some(index) = pool.position(id) else {
                return Commit::Unchanged(None);
            };
            let mut next = (*pool.backends[index]).clone();
            next.connections = if delta.is_negative() {
                next.connections.saturating_sub(delta.unsigned_abs())
            } else {
                next.connections.saturating_add(delta.unsigned_abs())
            };
            let snapshot = (next.address(), next.connections);
            Commit::Replace(pool.with_replaced(index, next, false), Some(snapshot))
        });

        match updated {
            Some((address, connections)) => {
                metrics::record_backend_connections(&address, connections);
                true
            }
            None => false,
        }
    }

    /// Change a backend's weight. Returns false when the id is unknown.
    ///
    /// Weight shapes selection, so a change moves the epoch as well.
    pub fn set_weight(&self, id: BackendId, weight: u32) -> Result<bool, DispatchError> {
        if weight == 0 {
            return Err(DispatchError::InvalidBackend("weight must be at least 1".into()));
        }
        let changed = self.commit(|pool| {
            let Some(index) = pool.position(id) else {
                return Commit::Unchanged(None);
            };
            let current = &pool.backends[index];
            if current.weight == weight {
                return Commit::Unchanged(Some(None));
            }
            let mut next = (**current).clone();
            let previous = next.weight;
            next.weight = weight;
            Commit::Replace(pool.with_replaced(index, next, true), Some(Some(previous)))
        });

        match changed {
            Some(Some(previous)) => {
                tracing::info!(backend_id = %id, previous, weight, "Backend weight changed");
                Ok(true)
            }
            Some(None) => Ok(true),
            None => Ok(false),
        }
    }

    /// Exclude a backend from selection while keeping it probed.
    pub fn drain(&self, id: BackendId) -> bool {
        self.set_draining(id, true)
    }

    /// Return a drained backend to whatever its probes say it is.
    pub fn undrain(&self, id: BackendId) -> bool {
        self.set_draining(id, false)
    }

    fn set_draining(&self, id: BackendId, draining: bool) -> bool {
        let changed = self.commit(|pool| {
            let Some(index) = pool.position(id) else {
                return Commit::Unchanged(None);
            };
            let current = &pool.backends[index];
            if current.draining == draining {
                return Commit::Unchanged(Some(false));
            }
            let mut next = (**current).clone();
            next.draining = draining;
            let selectable_changed = next.is_selectable() != current.is_selectable();
            Commit::Replace(pool.with_replaced(index, next, selectable_changed), Some(true))
        });

        match changed {
            Some(true) => {
                tracing::info!(backend_id = %id, draining, "Backend drain state changed");
                true
            }
            Some(false) => true,
            None => false,
        }
    }

    /// Publish the pool produced by `f`, retrying if another writer won.
    fn commit<R>(&self, mut f: impl FnMut(&Pool) -> Commit<R>) -> R {
        let mut current = self.pool.load_full();
        loop {
            match f(&current) {
                Commit::Unchanged(r) => return r,
                Commit::Replace(next, r) => {
                    let epoch_moved = next.epoch != current.epoch;
                    let epoch = next.epoch;
                    let prev = self.pool.compare_and_swap(&current, Arc::new(next));
                    if Arc::ptr_eq(&*prev, &current) {
                        if epoch_moved {
                            self.membership.send_replace(epoch);
                        }
                        return r;
                    }
                    current = Guard::into_inner(prev);
                }
            }
        }
    }
}

fn validate_spec(spec: &BackendSpec) -> Result<(), DispatchError> {
    if spec.host.trim().is_empty() {
        return Err(DispatchError::InvalidBackend("host must not be empty".into()));
    }
    if spec.port == 0 {
        return Err(DispatchError::InvalidBackend("port must be non-zero".into()));
    }
    if spec.weight == 0 {
        return Err(DispatchError::InvalidBackend("weight must be at least 1".into()));
    }
    Ok(())
}
