//! Host header to service pool lookup.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use axum::http::uri::Authority;
use tokio::task::JoinHandle;

use crate::config::schema::DispatchConfig;
use crate::engine::DispatchEngine;
use crate::lifecycle::Shutdown;
use crate::load_balancer::DispatchError;

/// Name of the pool built from the top-level `[[backends]]`.
pub const DEFAULT_POOL: &str = "default";

/// Canonical form of a Host value: lowercase, without port.
pub fn normalize_host(raw: &str) -> String {
    let raw = raw.trim();
    match Authority::from_str(raw) {
        Ok(authority) => authority.host().to_ascii_lowercase(),
        Err(_) => raw.to_ascii_lowercase(),
    }
}

/// A named pool and the hosts routed to it.
#[derive(Debug)]
pub struct Service {
    name: String,
    hosts: Vec<String>,
    engine: Arc<DispatchEngine>,
}

impl Service {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalized hosts, in configuration order.
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn engine(&self) -> &Arc<DispatchEngine> {
        &self.engine
    }
}

/// Immutable map from Host to engine, plus the default pool.
#[derive(Debug)]
pub struct ServiceRouter {
    default: Arc<DispatchEngine>,
    services: Vec<Service>,
    by_host: HashMap<String, usize>,
}

impl ServiceRouter {
    /// Router with only the default pool.
    pub fn single(engine: Arc<DispatchEngine>) -> Self {
        Self {
            default: engine,
            services: Vec::new(),
            by_host: HashMap::new(),
        }
    }

    /// Build the default pool and one engine per configured service.
    pub fn from_config(config: &DispatchConfig) -> Result<Self, DispatchError> {
        let default = Arc::new(DispatchEngine::from_config(config)?);
        let mut services = Vec::with_capacity(config.services.len());
        let mut by_host = HashMap::new();

        for service in &config.services {
            let engine = Arc::new(DispatchEngine::from_config(&config.for_service(service))?);
            let hosts: Vec<String> = service.hosts.iter().map(|h| normalize_host(h)).collect();
            for host in &hosts {
                if by_host.insert(host.clone(), services.len()).is_some() {
                    return Err(DispatchError::InvalidConfiguration(format!(
                        "host '{}' is mapped to more than one service",
                        host
                    )));
                }
            }
            tracing::info!(
                service = %service.name,
                hosts = ?hosts,
                algorithm = %engine.tuning().algorithm,
                backends = service.backends.len(),
                "Service pool initialized"
            );
            services.push(Service {
                name: service.name.clone(),
                hosts,
                engine,
            });
        }

        Ok(Self {
            default,
            services,
            by_host,
        })
    }

    pub fn default_engine(&self) -> &Arc<DispatchEngine> {
        &self.default
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// Pool serving `host`. Unknown or missing hosts go to the default pool.
    pub fn resolve(&self, host: Option<&str>) -> (&str, &Arc<DispatchEngine>) {
        let service = host
            .map(normalize_host)
            .and_then(|h| self.by_host.get(&h))
            .map(|&index| &self.services[index]);
        match service {
            Some(service) => (service.name.as_str(), &service.engine),
            None => (DEFAULT_POOL, &self.default),
        }
    }

    /// Pool by name; `None` selects the default pool.
    pub fn pool(&self, name: Option<&str>) -> Option<&Arc<DispatchEngine>> {
        match name {
            None => Some(&self.default),
            Some(name) if name.eq_ignore_ascii_case(DEFAULT_POOL) => Some(&self.default),
            Some(name) => self
                .services
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(name))
                .map(|s| &s.engine),
        }
    }

    /// Every pool as `(name, hosts, engine)`, default first.
    pub fn pools(&self) -> impl Iterator<Item = (&str, &[String], &Arc<DispatchEngine>)> {
        std::iter::once((DEFAULT_POOL, &[] as &[String], &self.default)).chain(
            self.services
                .iter()
                .map(|s| (s.name.as_str(), s.hosts.as_slice(), &s.engine)),
        )
    }

    /// Apply a reloaded configuration to every existing pool.
    ///
    /// Services cannot be added, removed or remapped at runtime; such edits
    /// are logged and wait for a restart.
    pub fn apply_config(&self, config: &DispatchConfig) -> Result<(), DispatchError> {
        self.default.apply_config(config)?;

        for service in &config.services {
            let Some(existing) = self
                .services
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(&service.name))
            else {
                tracing::warn!(service = %service.name, "New service takes effect after a restart");
                continue;
            };
            let hosts: Vec<String> = service.hosts.iter().map(|h| normalize_host(h)).collect();
            if hosts != existing.hosts {
                tracing::warn!(
                    service = %existing.name,
                    current = ?existing.hosts,
                    requested = ?hosts,
                    "Host mapping changes take effect after a restart"
                );
            }
            existing.engine.apply_config(&config.for_service(service))?;
        }

        for existing in &self.services {
            let kept = config
                .services
                .iter()
                .any(|s| s.name.eq_ignore_ascii_case(&existing.name));
            if !kept {
                tracing::warn!(service = %existing.name, "Service removed from config stays active until restart");
            }
        }
        Ok(())
    }

    /// Start the health supervisor of every pool that has active checks.
    pub fn spawn_health_checkers(&self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        self.pools()
            .filter_map(|(_, _, engine)| engine.spawn_health_checker(shutdown.subscribe()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{BackendConfig, ServiceConfig};
    use crate::load_balancer::Algorithm;

    fn backend(host: &str, port: u16, weight: u32) -> BackendConfig {
        BackendConfig {
            host: host.into(),
            port,
            weight,
        }
    }

    fn config() -> DispatchConfig {
        let mut config = DispatchConfig::default();
        config.backends = vec![backend("10.0.0.1", 80, 1)];
        config.services = vec![
            ServiceConfig {
                name: "api".into(),
                hosts: vec!["api.example.com".into()],
                algorithm: Some(Algorithm::ConsistentHash),
                sticky_sessions: Some(true),
                backends: vec![backend("10.0.1.1", 8080, 1), backend("10.0.1.2", 8080, 1)],
            },
            ServiceConfig {
                name: "web".into(),
                hosts: vec!["www.example.com".into(), "example.com".into()],
                algorithm: None,
                sticky_sessions: None,
                backends: vec![backend("10.0.2.1", 80, 1)],
            },
        ];
        config
    }

    #[test]
    fn test_normalize_host() {
        assert_eq!(normalize_host("API.Example.com"), "api.example.com");
        assert_eq!(normalize_host(" api.example.com:8443 "), "api.example.com");
        assert_eq!(normalize_host("127.0.0.1:80"), "127.0.0.1");
        assert_eq!(normalize_host(""), "");
    }

    #[test]
    fn test_resolve_by_host() {
        let router = ServiceRouter::from_config(&config()).unwrap();

        let (name, engine) = router.resolve(Some("API.example.com:8080"));
        assert_eq!(name, "api");
        assert_eq!(engine.list_backends().len(), 2);

        let (name, _) = router.resolve(Some("example.com"));
        assert_eq!(name, "web");

        let (name, engine) = router.resolve(Some("unknown.example.com"));
        assert_eq!(name, DEFAULT_POOL);
        assert!(Arc::ptr_eq(engine, router.default_engine()));

        let (name, _) = router.resolve(None);
        assert_eq!(name, DEFAULT_POOL);
    }

    #[test]
    fn test_service_pools_are_independent() {
        let router = ServiceRouter::from_config(&config()).unwrap();

        let api = router.pool(Some("API")).unwrap();
        assert_eq!(api.tuning().algorithm, Algorithm::ConsistentHash);
        assert!(api.dispatcher().sticky().is_enabled());

        let web = router.pool(Some("web")).unwrap();
        assert_eq!(web.tuning().algorithm, Algorithm::RoundRobin);
        assert!(!web.dispatcher().sticky().is_enabled());

        let default = router.pool(None).unwrap();
        assert_eq!(default.list_backends().len(), 1);
        assert_eq!(default.list_backends()[0].host, "10.0.0.1");
        assert!(Arc::ptr_eq(default, router.pool(Some("default")).unwrap()));

        assert!(router.pool(Some("missing")).is_none());
        assert_eq!(router.pools().count(), 3);
    }

    #[test]
    fn test_reload_updates_existing_services_only() {
        let mut config = config();
        let router = ServiceRouter::from_config(&config).unwrap();

        config.services[0].backends[0].weight = 4;
        config.services[0].algorithm = Some(Algorithm::LeastConnections);
        config.services.push(ServiceConfig {
            name: "late".into(),
            hosts: vec!["late.example.com".into()],
            algorithm: None,
            sticky_sessions: None,
            backends: vec![backend("10.0.3.1", 80, 1)],
        });
        router.apply_config(&config).unwrap();

        let api = router.pool(Some("api")).unwrap();
        assert_eq!(api.list_backends()[0].weight, 4);
        assert_eq!(api.tuning().algorithm, Algorithm::LeastConnections);
        assert!(router.pool(Some("late")).is_none());
        assert_eq!(router.resolve(Some("late.example.com")).0, DEFAULT_POOL);
    }

    #[test]
    fn test_conflicting_hosts_rejected() {
        let mut config = config();
        config.services[1].hosts.push("API.example.com".into());
        assert!(matches!(
            ServiceRouter::from_config(&config),
            Err(DispatchError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn test_one_health_checker_per_pool() {
        let router = ServiceRouter::from_config(&config()).unwrap();
        let shutdown = Shutdown::new();

        let handles = router.spawn_health_checkers(&shutdown);
        assert_eq!(handles.len(), 3);

        shutdown.trigger();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
