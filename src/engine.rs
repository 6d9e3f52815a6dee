//! Engine facade.
//!
//! Owns the registry, the shared tuning and the dispatcher, and exposes the
//! operations the admin API, the proxy and the CLI are built on.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::schema::DispatchConfig;
use crate::health::active::HealthChecker;
use crate::health::passive::{PassivePolicy, RequestOutcome};
use crate::health::probe::ProbeKind;
use crate::load_balancer::backend::{Backend, BackendId, BackendSpec, HealthStatus};
use crate::load_balancer::sticky::StickySessions;
use crate::load_balancer::{BackendRegistry, DispatchError, Dispatcher, RouteLease};
use crate::tuning::{SharedTuning, Tuning};

/// Read-only view of one backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendView {
    pub id: BackendId,
    pub host: String,
    pub port: u16,
    pub status: HealthStatus,
    pub weight: u32,
    pub connections: u64,
}

impl From<&Backend> for BackendView {
    fn from(backend: &Backend) -> Self {
        Self {
            id: backend.id,
            host: backend.host.clone(),
            port: backend.port,
            status: backend.status(),
            weight: backend.weight,
            connections: backend.connections,
        }
    }
}

#[derive(Debug)]
pub struct DispatchEngine {
    registry: Arc<BackendRegistry>,
    tuning: SharedTuning,
    dispatcher: Arc<Dispatcher>,
    probe: ProbeKind,
    active_checks: bool,
}

impl DispatchEngine {
    /// Engine with the given tuning, TCP probing, passive health disabled
    /// and no sticky sessions.
    pub fn new(tuning: Tuning) -> Result<Self, DispatchError> {
        tuning.validate()?;
        let tuning = tuning.shared();
        let registry = Arc::new(BackendRegistry::with_tuning(tuning.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            tuning.clone(),
            PassivePolicy::disabled(),
            StickySessions::new(false, std::time::Duration::from_secs(300)),
        ));
        Ok(Self {
            registry,
            tuning,
            dispatcher,
            probe: ProbeKind::Tcp,
            active_checks: true,
        })
    }

    /// Build an engine from a validated configuration and register its
    /// backends.
    pub fn from_config(config: &DispatchConfig) -> Result<Self, DispatchError> {
        let tuning = config.tuning();
        tuning.validate()?;
        let tuning = tuning.shared();
        let mut registry = BackendRegistry::with_tuning(tuning.clone());
        if !config.health_check.enabled {
            registry = registry.assume_healthy();
        }
        let registry = Arc::new(registry);
        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            tuning.clone(),
            config.passive_health.policy(),
            StickySessions::new(
                config.balancing.sticky_sessions,
                config.balancing.sticky_ttl(),
            ),
        ));

        let engine = Self {
            registry,
            tuning,
            dispatcher,
            probe: config.health_check.probe_kind(),
            active_checks: config.health_check.enabled,
        };
        for backend in &config.backends {
            engine.registry.register(backend.spec())?;
        }
        Ok(engine)
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn tuning(&self) -> Tuning {
        (**self.tuning.load()).clone()
    }

    pub fn register(&self, host: &str, port: u16, weight: u32) -> Result<BackendId, DispatchError> {
        self.registry.register(BackendSpec::new(host, port, weight))
    }

    /// Unknown ids are a no-op; returns whether a backend was removed.
    pub fn deregister(&self, id: BackendId) -> bool {
        self.registry.deregister(id)
    }

    pub fn drain(&self, id: BackendId) -> bool {
        self.registry.drain(id)
    }

    pub fn undrain(&self, id: BackendId) -> bool {
        self.registry.undrain(id)
    }

    /// Backends in registration order.
    pub fn list_backends(&self) -> Vec<BackendView> {
        self.registry
            .snapshot()
            .backends()
            .iter()
            .map(|b| BackendView::from(b.as_ref()))
            .collect()
    }

    pub fn backend(&self, id: BackendId) -> Option<BackendView> {
        self.registry
            .snapshot()
            .get(id)
            .map(|b| BackendView::from(b.as_ref()))
    }

    /// Pick a backend for `key`. Pair with [`DispatchEngine::complete`].
    pub fn route(&self, key: &str) -> Result<BackendId, DispatchError> {
        self.dispatcher.route(key)
    }

    pub fn route_lease(&self, key: &str) -> Result<RouteLease, DispatchError> {
        self.dispatcher.route_lease(key)
    }

    /// Which backend `key` would be routed to right now. Nothing is
    /// recorded against it.
    pub fn preview_route(&self, key: &str) -> Result<BackendView, DispatchError> {
        let lease = self.dispatcher.route_lease(key)?;
        let mut view = BackendView::from(lease.backend().as_ref());
        drop(lease);
        view.connections = self
            .registry
            .snapshot()
            .get(view.id)
            .map(|b| b.connections)
            .unwrap_or(view.connections);
        Ok(view)
    }

    pub fn complete(&self, id: BackendId, outcome: RequestOutcome) {
        self.dispatcher.complete(id, outcome);
    }

    /// Replace the tuning as a whole. Components pick it up on their next
    /// selection or probe cycle.
    pub fn configure(&self, tuning: Tuning) -> Result<(), DispatchError> {
        tuning.validate()?;
        let previous = self.tuning.swap(Arc::new(tuning.clone()));
        tracing::info!(
            algorithm = %tuning.algorithm,
            interval = ?tuning.health_interval,
            timeout = ?tuning.health_timeout,
            failure_threshold = tuning.failure_threshold,
            success_threshold = tuning.success_threshold,
            previous_algorithm = %previous.algorithm,
            "Engine reconfigured"
        );
        Ok(())
    }

    /// Edit the current tuning in place. The edit is merged into whatever
    /// tuning is current when it commits, so concurrent partial updates
    /// never overwrite each other. Returns the tuning that was published.
    pub fn reconfigure<F>(&self, mut edit: F) -> Result<Tuning, DispatchError>
    where
        F: FnMut(&mut Tuning),
    {
        let mut outcome = Ok(Tuning::default());
        self.tuning.rcu(|current| {
            let mut next = (**current).clone();
            edit(&mut next);
            match next.validate() {
                Ok(()) => {
                    outcome = Ok(next.clone());
                    Arc::new(next)
                }
                Err(e) => {
                    outcome = Err(e);
                    current.clone()
                }
            }
        });

        let tuning = outcome?;
        tracing::info!(
            algorithm = %tuning.algorithm,
            interval = ?tuning.health_interval,
            timeout = ?tuning.health_timeout,
            failure_threshold = tuning.failure_threshold,
            success_threshold = tuning.success_threshold,
            "Engine tuning updated"
        );
        Ok(tuning)
    }

    /// Apply a reloaded configuration: tuning, passive policy, session
    /// affinity, backends not yet registered, and weight edits of backends
    /// that are. Backends missing from the file are left alone.
    pub fn apply_config(&self, config: &DispatchConfig) -> Result<(), DispatchError> {
        self.configure(config.tuning())?;
        self.dispatcher
            .set_passive_policy(config.passive_health.policy());

        let sticky = self.dispatcher.sticky();
        sticky.set_ttl(config.balancing.sticky_ttl());
        sticky.set_enabled(config.balancing.sticky_sessions);

        let (mut added, mut reweighted) = (0, 0);
        for backend in &config.backends {
            match self.registry.register(backend.spec()) {
                Ok(_) => added += 1,
                Err(DispatchError::DuplicateBackend { .. }) => {
                    let existing = self
                        .registry
                        .snapshot()
                        .find_identity(&backend.host, backend.port)
                        .map(|b| (b.id, b.weight));
                    if let Some((id, weight)) = existing {
                        if weight != backend.weight && self.registry.set_weight(id, backend.weight)? {
                            reweighted += 1;
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
        tracing::info!(
            added,
            reweighted,
            total = self.registry.snapshot().len(),
            "Configuration applied"
        );
        Ok(())
    }

    /// Start the health supervisor, unless active checks are disabled.
    pub fn spawn_health_checker(
        &self,
        shutdown: broadcast::Receiver<()>,
    ) -> Option<JoinHandle<()>> {
        if !self.active_checks {
            tracing::info!("Active health checks disabled");
            return None;
        }
        let checker = HealthChecker::new(
            self.registry.clone(),
            self.tuning.clone(),
            self.probe.clone(),
        );
        Some(tokio::spawn(checker.run(shutdown)))
    }
}
