//! Active health checking.
//!
//! # Responsibilities
//! - Run one probe loop per registered backend
//! - Start and stop loops as backends come and go
//! - Feed every probe result into the registry
//!
//! Loops re-read the tuned interval and timeout before every probe, so a
//! reconfiguration applies from the next cycle on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time;

use crate::health::probe::{ProbeKind, Prober};
use crate::load_balancer::backend::BackendId;
use crate::load_balancer::registry::BackendRegistry;
use crate::observability::metrics;
use crate::tuning::SharedTuning;

pub struct HealthChecker {
    registry: Arc<BackendRegistry>,
    tuning: SharedTuning,
    kind: ProbeKind,
    prober: Prober,
}

impl HealthChecker {
    pub fn new(registry: Arc<BackendRegistry>, tuning: SharedTuning, kind: ProbeKind) -> Self {
        Self {
            registry,
            tuning,
            kind,
            prober: Prober::new(),
        }
    }

    /// Supervise probe loops until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        {
            let tuning = self.tuning.load();
            tracing::info!(
                interval = ?tuning.health_interval,
                timeout = ?tuning.health_timeout,
                probe = ?self.kind,
                "Health checker starting"
            );
        }

        let mut membership = self.registry.subscribe_membership();
        let mut loops: HashMap<BackendId, JoinHandle<()>> = HashMap::new();
        self.reconcile(&mut loops);

        loop {
            tokio::select! {
                changed = membership.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.reconcile(&mut loops);
                }
                _ = shutdown.recv() => {
                    tracing::info!("Health checker received shutdown signal, exiting loop");
                    break;
                }
            }
        }

        for (_, handle) in loops {
            handle.abort();
        }
    }

    /// Start loops for new backends and stop loops for removed ones.
    fn reconcile(&self, loops: &mut HashMap<BackendId, JoinHandle<()>>) {
        let pool = self.registry.snapshot();

        loops.retain(|id, handle| {
            let keep = pool.get(*id).is_some() && !handle.is_finished();
            if !keep {
                handle.abort();
            }
            keep
        });

        for backend in pool.backends() {
            if loops.contains_key(&backend.id) {
                continue;
            }
            let handle = tokio::spawn(probe_loop(
                self.registry.clone(),
                self.tuning.clone(),
                self.prober.clone(),
                self.kind.clone(),
                backend.id,
                backend.address(),
            ));
            loops.insert(backend.id, handle);
        }
    }
}

/// Uniform stagger in `[0, interval)` so probes of a freshly loaded pool
/// do not fire together.
fn startup_jitter(interval: Duration) -> Duration {
    let millis = interval.as_millis() as u64;
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..millis))
}

async fn probe_loop(
    registry: Arc<BackendRegistry>,
    tuning: SharedTuning,
    prober: Prober,
    kind: ProbeKind,
    id: BackendId,
    addr: String,
) {
    let stagger = startup_jitter(tuning.load().health_interval);
    time::sleep(stagger).await;

    loop {
        let (interval, timeout) = {
            let t = tuning.load();
            (t.health_interval, t.health_timeout)
        };

        let result = prober.probe(&addr, &kind, timeout).await;
        metrics::record_probe(&addr, result.is_success(), result.latency);
        tracing::debug!(backend_id = %id, addr = %addr, success = result.is_success(), "Health probe completed");

        if registry.mark_result(id, &result).is_none() {
            tracing::debug!(backend_id = %id, addr = %addr, "Backend gone, stopping probe loop");
            return;
        }

        time::sleep(interval).await;
    }
}
