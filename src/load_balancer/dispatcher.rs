//! Request-facing entry point of the dispatch core.
//!
//! # Responsibilities
//! - Take a pool snapshot and restrict it to the healthy subset
//! - Delegate the pick to the active balancer (or a sticky binding)
//! - Count the request against the chosen backend
//! - On completion, release the count and feed passive health
//!
//! # Design Decisions
//! - Never waits on health probing; only reads the latest snapshot
//! - At most one re-snapshot, and only if membership moved mid-call
//! - Balancer swaps happen between selections, never during one

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;

use crate::health::passive::{PassivePolicy, RequestOutcome};
use crate::load_balancer::backend::{Backend, BackendId};
use crate::load_balancer::registry::BackendRegistry;
use crate::load_balancer::sticky::StickySessions;
use crate::load_balancer::{Balancer, DispatchError, SelectionContext};
use crate::observability::metrics;
use crate::tuning::SharedTuning;

#[derive(Debug)]
pub struct Dispatcher {
    registry: Arc<BackendRegistry>,
    tuning: SharedTuning,
    balancer: ArcSwap<Arc<dyn Balancer>>,
    passive: ArcSwap<PassivePolicy>,
    sticky: StickySessions,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<BackendRegistry>,
        tuning: SharedTuning,
        passive: PassivePolicy,
        sticky: StickySessions,
    ) -> Self {
        let balancer = tuning.load().algorithm.build();
        Self {
            registry,
            tuning,
            balancer: ArcSwap::from_pointee(balancer),
            passive: ArcSwap::from_pointee(passive),
            sticky,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn sticky(&self) -> &StickySessions {
        &self.sticky
    }

    pub fn passive_policy(&self) -> PassivePolicy {
        **self.passive.load()
    }

    pub fn set_passive_policy(&self, policy: PassivePolicy) {
        self.passive.store(Arc::new(policy));
    }

    /// Pick a backend for `key` and count the request against it.
    ///
    /// The caller must report completion with [`Dispatcher::complete`].
    pub fn route(&self, key: &str) -> Result<BackendId, DispatchError> {
        self.acquire(key).map(|b| b.id)
    }

    /// Like [`Dispatcher::route`], returning a guard that settles the request.
    pub fn route_lease(self: &Arc<Self>, key: &str) -> Result<RouteLease, DispatchError> {
        let backend = self.acquire(key)?;
        Ok(RouteLease {
            dispatcher: self.clone(),
            backend,
            key: key.to_string(),
            started: Instant::now(),
            settled: false,
        })
    }

    /// Release a routed request and record how it went.
    pub fn complete(&self, id: BackendId, outcome: RequestOutcome) {
        self.settle(id, None, outcome);
    }

    fn acquire(&self, key: &str) -> Result<Arc<Backend>, DispatchError> {
        let start = Instant::now();
        let result = match self.attempt(key) {
            Ok(backend) => Ok(backend),
            Err(epoch) if self.registry.epoch() != epoch => {
                tracing::debug!(key, "Pool changed during selection, retrying once");
                self.attempt(key).map_err(|_| DispatchError::NoHealthyBackend)
            }
            Err(_) => Err(DispatchError::NoHealthyBackend),
        };

        match &result {
            Ok(backend) => {
                tracing::trace!(key, backend_id = %backend.id, addr = %backend.address(), "Request routed");
                metrics::record_route("routed", start);
            }
            Err(_) => {
                tracing::debug!(key, "No healthy backend for request");
                metrics::record_route("no_healthy_backend", start);
            }
        }
        result
    }

    /// One selection against one snapshot. On failure returns the epoch the
    /// snapshot was taken at.
    fn attempt(&self, key: &str) -> Result<Arc<Backend>, u64> {
        let pool = self.registry.snapshot();
        let ctx = SelectionContext::from_pool(&pool, key);
        if ctx.is_empty() {
            return Err(ctx.epoch());
        }

        let chosen = match self.sticky_target(&ctx) {
            Some(backend) => backend,
            None => {
                let balancer = self.active_balancer();
                let id = balancer.select(&ctx).map_err(|_| ctx.epoch())?;
                ctx.find(id).cloned().ok_or(ctx.epoch())?
            }
        };

        // Deregistered between snapshot and now.
        if !self.registry.adjust_connections(chosen.id, 1) {
            return Err(ctx.epoch());
        }
        Ok(chosen)
    }

    fn sticky_target(&self, ctx: &SelectionContext<'_>) -> Option<Arc<Backend>> {
        let id = self.sticky.get(ctx.key())?;
        match ctx.find(id) {
            Some(backend) => Some(backend.clone()),
            None => {
                self.sticky.unbind(ctx.key());
                None
            }
        }
    }

    /// Balancer for the currently tuned algorithm, swapping in a fresh one
    /// when the algorithm was reconfigured.
    fn active_balancer(&self) -> Arc<Arc<dyn Balancer>> {
        let wanted = self.tuning.load().algorithm;
        loop {
            let current = self.balancer.load_full();
            if current.algorithm() == wanted {
                return current;
            }
            let prev = self
                .balancer
                .compare_and_swap(&current, Arc::new(wanted.build()));
            if Arc::ptr_eq(&*prev, &current) {
                tracing::info!(from = %current.algorithm(), to = %wanted, "Selection algorithm switched");
            }
        }
    }

    fn settle(&self, id: BackendId, key: Option<&str>, outcome: RequestOutcome) {
        self.registry.adjust_connections(id, -1);

        if let Some(key) = key {
            match outcome {
                RequestOutcome::Success { .. } => self.sticky.bind(key, id),
                // Alive but erroring: keep whatever binding exists.
                RequestOutcome::ServerError { .. } => {}
                RequestOutcome::Failure | RequestOutcome::Timeout => self.sticky.unbind(key),
            }
        }

        let policy = self.passive_policy();
        if policy.enabled {
            let hysteresis = policy.hysteresis(self.registry.hysteresis());
            self.registry
                .mark_result_with(id, &outcome.to_result(), &hysteresis);
        }
    }

    fn release(&self, id: BackendId) {
        self.registry.adjust_connections(id, -1);
    }
}

/// A routed request.
///
/// Dropping an unfinished lease only releases the connection count; no
/// health signal is recorded.
#[derive(Debug)]
pub struct RouteLease {
    dispatcher: Arc<Dispatcher>,
    backend: Arc<Backend>,
    key: String,
    started: Instant,
    settled: bool,
}

impl RouteLease {
    pub fn id(&self) -> BackendId {
        self.backend.id
    }

    pub fn address(&self) -> String {
        self.backend.address()
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn finish(mut self, outcome: RequestOutcome) {
        self.settled = true;
        self.dispatcher
            .settle(self.backend.id, Some(&self.key), outcome);
    }
}

impl Drop for RouteLease {
    fn drop(&mut self) {
        if !self.settled {
            self.dispatcher.release(self.backend.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::state::HealthCheckResult;
    use crate::load_balancer::backend::BackendSpec;
    use crate::load_balancer::Algorithm;
    use crate::tuning::Tuning;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Deregisters each listed victim the moment it picks it, the way a
    /// concurrent admin call would between selection and counting.
    #[derive(Debug)]
    struct Vanishing {
        registry: Arc<BackendRegistry>,
        victims: parking_lot::Mutex<Vec<BackendId>>,
    }

    impl Balancer for Vanishing {
        fn select(&self, ctx: &SelectionContext<'_>) -> Result<BackendId, DispatchError> {
            if let Some(victim) = self.victims.lock().pop() {
                self.registry.deregister(victim);
                return Ok(victim);
            }
            ctx.healthy()
                .first()
                .map(|b| b.id)
                .ok_or(DispatchError::NoHealthyBackend)
        }

        fn algorithm(&self) -> Algorithm {
            Algorithm::RoundRobin
        }
    }

    fn install_vanishing(f: &Fixture, victims: Vec<BackendId>) {
        let balancer: Arc<dyn Balancer> = Arc::new(Vanishing {
            registry: f.registry.clone(),
            victims: parking_lot::Mutex::new(victims),
        });
        f.dispatcher.balancer.store(Arc::new(balancer));
    }

    struct Fixture {
        tuning: SharedTuning,
        registry: Arc<BackendRegistry>,
        dispatcher: Arc<Dispatcher>,
    }

    fn fixture(algorithm: Algorithm, passive: PassivePolicy, sticky: bool) -> Fixture {
        let tuning = Tuning {
            algorithm,
            ..Tuning::default()
        }
        .shared();
        let registry = Arc::new(BackendRegistry::with_tuning(tuning.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            tuning.clone(),
            passive,
            StickySessions::new(sticky, Duration::from_secs(300)),
        ));
        Fixture {
            tuning,
            registry,
            dispatcher,
        }
    }

    fn add_healthy(registry: &BackendRegistry, port: u16, weight: u32) -> BackendId {
        let id = registry
            .register(BackendSpec::new("127.0.0.1", port, weight))
            .unwrap();
        registry.mark_result(id, &HealthCheckResult::success(None));
        registry.mark_result(id, &HealthCheckResult::success(None));
        id
    }

    fn ok() -> RequestOutcome {
        RequestOutcome::Success {
            latency: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_no_healthy_backend() {
        let f = fixture(Algorithm::RoundRobin, PassivePolicy::disabled(), false);
        assert_eq!(f.dispatcher.route("k"), Err(DispatchError::NoHealthyBackend));

        // Registered but not yet probed healthy.
        f.registry
            .register(BackendSpec::new("127.0.0.1", 9000, 1))
            .unwrap();
        assert_eq!(f.dispatcher.route("k"), Err(DispatchError::NoHealthyBackend));
    }

    #[test]
    fn test_route_counts_connections() {
        let f = fixture(Algorithm::LeastConnections, PassivePolicy::disabled(), false);
        let a = add_healthy(&f.registry, 9000, 1);
        let b = add_healthy(&f.registry, 9001, 1);

        assert_eq!(f.dispatcher.route("k").unwrap(), a);
        assert_eq!(f.dispatcher.route("k").unwrap(), b);
        assert_eq!(f.dispatcher.route("k").unwrap(), a);
        assert_eq!(f.registry.snapshot().get(a).unwrap().connections, 2);

        f.dispatcher.complete(a, ok());
        f.dispatcher.complete(a, ok());
        assert_eq!(f.registry.snapshot().get(a).unwrap().connections, 0);
        assert_eq!(f.dispatcher.route("k").unwrap(), a);
    }

    #[test]
    fn test_passive_failures_evict_backend() {
        let policy = PassivePolicy {
            enabled: true,
            ..PassivePolicy::default()
        };
        let f = fixture(Algorithm::RoundRobin, policy, false);
        let bad = add_healthy(&f.registry, 9000, 1);
        let good = add_healthy(&f.registry, 9001, 1);

        for _ in 0..3 {
            f.dispatcher.complete(bad, RequestOutcome::Failure);
        }

        for _ in 0..4 {
            let id = f.dispatcher.route("k").unwrap();
            assert_eq!(id, good);
            f.dispatcher.complete(id, ok());
        }
    }

    #[test]
    fn test_passive_disabled_ignores_failures() {
        let f = fixture(Algorithm::RoundRobin, PassivePolicy::disabled(), false);
        let id = add_healthy(&f.registry, 9000, 1);

        for _ in 0..10 {
            f.dispatcher.complete(id, RequestOutcome::Timeout);
        }
        assert!(f.registry.snapshot().get(id).unwrap().is_selectable());
    }

    #[test]
    fn test_drained_backend_not_selected() {
        let f = fixture(Algorithm::RoundRobin, PassivePolicy::disabled(), false);
        let a = add_healthy(&f.registry, 9000, 1);
        let b = add_healthy(&f.registry, 9001, 1);

        f.registry.drain(a);
        for _ in 0..4 {
            assert_eq!(f.dispatcher.route("k").unwrap(), b);
        }
    }

    #[test]
    fn test_dropped_lease_releases_connection() {
        let f = fixture(Algorithm::RoundRobin, PassivePolicy::disabled(), false);
        let id = add_healthy(&f.registry, 9000, 1);

        let lease = f.dispatcher.route_lease("k").unwrap();
        assert_eq!(lease.id(), id);
        assert_eq!(lease.address(), "127.0.0.1:9000");
        assert_eq!(f.registry.snapshot().get(id).unwrap().connections, 1);

        drop(lease);
        assert_eq!(f.registry.snapshot().get(id).unwrap().connections, 0);
    }

    #[test]
    fn test_sticky_session_pins_key() {
        let f = fixture(Algorithm::RoundRobin, PassivePolicy::disabled(), true);
        add_healthy(&f.registry, 9000, 1);
        add_healthy(&f.registry, 9001, 1);

        let first = f.dispatcher.route_lease("client-a").unwrap();
        let pinned = first.id();
        first.finish(ok());

        for _ in 0..5 {
            let lease = f.dispatcher.route_lease("client-a").unwrap();
            assert_eq!(lease.id(), pinned);
            lease.finish(ok());
        }
    }

    #[test]
    fn test_sticky_falls_back_when_backend_leaves() {
        let f = fixture(Algorithm::RoundRobin, PassivePolicy::disabled(), true);
        let a = add_healthy(&f.registry, 9000, 1);
        let b = add_healthy(&f.registry, 9001, 1);

        f.dispatcher.sticky().bind("client-a", a);
        f.registry.drain(a);

        let lease = f.dispatcher.route_lease("client-a").unwrap();
        assert_eq!(lease.id(), b);
        lease.finish(ok());
        assert_eq!(f.dispatcher.sticky().get("client-a"), Some(b));
    }

    #[test]
    fn test_failed_request_unbinds_sticky_key() {
        let f = fixture(Algorithm::RoundRobin, PassivePolicy::disabled(), true);
        let a = add_healthy(&f.registry, 9000, 1);

        f.dispatcher.sticky().bind("client-a", a);
        let lease = f.dispatcher.route_lease("client-a").unwrap();
        lease.finish(RequestOutcome::Failure);

        assert_eq!(f.dispatcher.sticky().get("client-a"), None);
    }

    #[test]
    fn test_server_error_does_not_bind_sticky_key() {
        let policy = PassivePolicy {
            enabled: true,
            ..PassivePolicy::default()
        };
        let f = fixture(Algorithm::RoundRobin, policy, true);
        let a = add_healthy(&f.registry, 9000, 1);

        let lease = f.dispatcher.route_lease("client-a").unwrap();
        lease.finish(RequestOutcome::from_status(500, Duration::from_millis(2)));
        assert_eq!(f.dispatcher.sticky().get("client-a"), None);

        // Still counted as alive by passive health.
        for _ in 0..5 {
            f.dispatcher
                .complete(a, RequestOutcome::from_status(500, Duration::ZERO));
        }
        assert!(f.registry.snapshot().get(a).unwrap().is_selectable());

        // An existing binding survives a server error.
        f.dispatcher.sticky().bind("client-b", a);
        let lease = f.dispatcher.route_lease("client-b").unwrap();
        lease.finish(RequestOutcome::from_status(500, Duration::ZERO));
        assert_eq!(f.dispatcher.sticky().get("client-b"), Some(a));
    }

    #[test]
    fn test_algorithm_swap_takes_effect_on_next_route() {
        let f = fixture(Algorithm::RoundRobin, PassivePolicy::disabled(), false);
        let a = add_healthy(&f.registry, 9000, 1);
        let b = add_healthy(&f.registry, 9001, 1);
        f.registry.adjust_connections(a, 5);

        assert_eq!(f.dispatcher.route("k").unwrap(), a);

        f.tuning.store(Arc::new(Tuning {
            algorithm: Algorithm::LeastConnections,
            ..Tuning::default()
        }));
        assert_eq!(f.dispatcher.route("k").unwrap(), b);
        assert_eq!(
            f.dispatcher.balancer.load().algorithm(),
            Algorithm::LeastConnections
        );
    }

    #[test]
    fn test_vanished_pick_is_retried_on_fresh_snapshot() {
        let f = fixture(Algorithm::RoundRobin, PassivePolicy::disabled(), false);
        let a = add_healthy(&f.registry, 9000, 1);
        let b = add_healthy(&f.registry, 9001, 1);
        install_vanishing(&f, vec![a]);

        assert_eq!(f.dispatcher.route("k"), Ok(b));
        assert!(f.registry.snapshot().get(a).is_none());
        assert_eq!(f.registry.snapshot().get(b).unwrap().connections, 1);
    }

    #[test]
    fn test_retry_happens_only_once() {
        let f = fixture(Algorithm::RoundRobin, PassivePolicy::disabled(), false);
        let a = add_healthy(&f.registry, 9000, 1);
        let b = add_healthy(&f.registry, 9001, 1);
        let c = add_healthy(&f.registry, 9002, 1);
        // Popped from the back: `a` first, then `b`.
        install_vanishing(&f, vec![b, a]);

        assert_eq!(f.dispatcher.route("k"), Err(DispatchError::NoHealthyBackend));
        assert_eq!(f.registry.snapshot().get(c).unwrap().connections, 0);
        assert_eq!(f.dispatcher.route("k"), Ok(c));
    }

    #[test]
    fn test_routing_survives_membership_churn() {
        let tuning = Tuning::default().shared();
        let registry = Arc::new(BackendRegistry::with_tuning(tuning.clone()).assume_healthy());
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            tuning,
            PassivePolicy::disabled(),
            StickySessions::new(false, Duration::from_secs(300)),
        ));
        let stable = registry
            .register(BackendSpec::new("127.0.0.1", 9001, 1))
            .unwrap();
        registry
            .register(BackendSpec::new("127.0.0.1", 9000, 1))
            .unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let churn = {
            let registry = registry.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    if let Some(id) = registry
                        .snapshot()
                        .find_identity("127.0.0.1", 9000)
                        .map(|b| b.id)
                    {
                        registry.deregister(id);
                    }
                    std::thread::sleep(Duration::from_micros(200));
                    let _ = registry.register(BackendSpec::new("127.0.0.1", 9000, 1));
                    std::thread::sleep(Duration::from_micros(200));
                }
            })
        };

        let failures = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let dispatcher = dispatcher.clone();
            let failures = failures.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..2000 {
                    match dispatcher.route_lease("k") {
                        Ok(lease) => lease.finish(ok()),
                        Err(_) => {
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        stop.store(true, Ordering::Relaxed);
        churn.join().unwrap();

        assert_eq!(failures.load(Ordering::Relaxed), 0);
        let pool = registry.snapshot();
        assert!(pool.get(stable).is_some());
        assert!(pool.backends().iter().all(|b| b.connections == 0));
    }

    #[test]
    fn test_concurrent_routing_balances_counts() {
        let f = fixture(Algorithm::RoundRobin, PassivePolicy::disabled(), false);
        for port in 9000..9004 {
            add_healthy(&f.registry, port, 1);
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let dispatcher = f.dispatcher.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..250 {
                    let lease = dispatcher.route_lease("k").unwrap();
                    lease.finish(RequestOutcome::Success {
                        latency: Duration::ZERO,
                    });
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let pool = f.registry.snapshot();
        assert!(pool.backends().iter().all(|b| b.connections == 0));
    }
}
