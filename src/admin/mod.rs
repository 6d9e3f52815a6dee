//! Admin HTTP API.
//!
//! Every route sits behind the bearer-token middleware in `auth.rs`.
//! Pool-scoped routes act on the default pool unless `?service=<name>`
//! selects a service pool.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{delete, get, post, put},
    Router,
};

use crate::engine::DispatchEngine;
use crate::routing::ServiceRouter;

use self::auth::admin_auth_middleware;
use self::handlers::*;

#[derive(Clone)]
pub struct AdminState {
    pub router: Arc<ServiceRouter>,
    pub api_key: Arc<String>,
}

impl AdminState {
    /// Admin state for a single pool.
    pub fn new(engine: Arc<DispatchEngine>, api_key: impl Into<String>) -> Self {
        Self::with_router(Arc::new(ServiceRouter::single(engine)), api_key)
    }

    pub fn with_router(router: Arc<ServiceRouter>, api_key: impl Into<String>) -> Self {
        Self {
            router,
            api_key: Arc::new(api_key.into()),
        }
    }

    /// Engine of the pool named by `?service=`, or the default pool.
    pub fn pool(&self, scope: &PoolQuery) -> Result<Arc<DispatchEngine>, ApiError> {
        self.router
            .pool(scope.service.as_deref())
            .cloned()
            .ok_or_else(|| ApiError::unknown_service(scope.service.as_deref().unwrap_or_default()))
    }
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/services", get(list_services))
        .route("/admin/backends", get(list_backends).post(register_backend))
        .route("/admin/backends/{id}", delete(deregister_backend))
        .route("/admin/backends/{id}/drain", post(drain_backend))
        .route("/admin/backends/{id}/undrain", post(undrain_backend))
        .route("/admin/route", get(preview_route))
        .route("/admin/config", put(configure))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            admin_auth_middleware,
        ))
        .with_state(state)
}
