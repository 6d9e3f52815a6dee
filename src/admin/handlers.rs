use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::admin::AdminState;
use crate::engine::BackendView;
use crate::load_balancer::backend::{BackendId, HealthStatus};
use crate::load_balancer::{Algorithm, DispatchError};

/// Error body returned by every admin endpoint.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(id: u64) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("backend {} not found", id),
        }
    }

    pub fn unknown_service(name: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("service '{}' not found", name),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        let status = match err {
            DispatchError::DuplicateBackend { .. } => StatusCode::CONFLICT,
            DispatchError::NoHealthyBackend => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::InvalidBackend(_) | DispatchError::InvalidConfiguration(_) => {
                StatusCode::BAD_REQUEST
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SystemStatus {
    pub version: String,
    pub status: String,
    pub algorithm: Algorithm,
    pub pool_version: u64,
    pub membership_epoch: u64,
    pub backends: usize,
    pub healthy: usize,
    pub draining: usize,
}

#[derive(Debug, Serialize)]
pub struct ServiceSummary {
    pub name: String,
    pub hosts: Vec<String>,
    pub algorithm: Algorithm,
    pub sticky_sessions: bool,
    pub backends: usize,
    pub healthy: usize,
}

/// `?service=<name>`; absent means the default pool.
#[derive(Debug, Default, Deserialize)]
pub struct PoolQuery {
    pub service: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
pub struct RouteQuery {
    pub key: String,
    pub service: Option<String>,
}

/// Partial tuning update; omitted fields keep their current value.
#[derive(Debug, Default, Deserialize)]
pub struct ConfigureRequest {
    pub algorithm: Option<Algorithm>,
    pub health_interval_secs: Option<u64>,
    pub health_timeout_ms: Option<u64>,
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
}

pub async fn get_status(
    State(state): State<AdminState>,
    Query(scope): Query<PoolQuery>,
) -> Result<Json<SystemStatus>, ApiError> {
    let engine = state.pool(&scope)?;
    let pool = engine.registry().snapshot();
    let count = |status: HealthStatus| {
        pool.backends()
            .iter()
            .filter(|b| b.status() == status)
            .count()
    };

    Ok(Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: "operational".to_string(),
        algorithm: engine.tuning().algorithm,
        pool_version: pool.version(),
        membership_epoch: pool.epoch(),
        backends: pool.len(),
        healthy: count(HealthStatus::Healthy),
        draining: count(HealthStatus::Draining),
    }))
}

pub async fn list_services(State(state): State<AdminState>) -> Json<Vec<ServiceSummary>> {
    let summaries = state
        .router
        .pools()
        .map(|(name, hosts, engine)| {
            let pool = engine.registry().snapshot();
            ServiceSummary {
                name: name.to_string(),
                hosts: hosts.to_vec(),
                algorithm: engine.tuning().algorithm,
                sticky_sessions: engine.dispatcher().sticky().is_enabled(),
                backends: pool.len(),
                healthy: pool
                    .backends()
                    .iter()
                    .filter(|b| b.status() == HealthStatus::Healthy)
                    .count(),
            }
        })
        .collect();
    Json(summaries)
}

pub async fn list_backends(
    State(state): State<AdminState>,
    Query(scope): Query<PoolQuery>,
) -> Result<Json<Vec<BackendView>>, ApiError> {
    Ok(Json(state.pool(&scope)?.list_backends()))
}

pub async fn register_backend(
    State(state): State<AdminState>,
    Query(scope): Query<PoolQuery>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<BackendView>), ApiError> {
    let engine = state.pool(&scope)?;
    let id = engine.register(&req.host, req.port, req.weight)?;
    let view = engine.backend(id).ok_or_else(|| ApiError::not_found(id.0))?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// Removing an unknown id is not an error.
pub async fn deregister_backend(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
    Query(scope): Query<PoolQuery>,
) -> Result<StatusCode, ApiError> {
    state.pool(&scope)?.deregister(BackendId(id));
    Ok(StatusCode::NO_CONTENT)
}

pub async fn drain_backend(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
    Query(scope): Query<PoolQuery>,
) -> Result<StatusCode, ApiError> {
    if state.pool(&scope)?.drain(BackendId(id)) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(id))
    }
}

pub async fn undrain_backend(
    State(state): State<AdminState>,
    Path(id): Path<u64>,
    Query(scope): Query<PoolQuery>,
) -> Result<StatusCode, ApiError> {
    if state.pool(&scope)?.undrain(BackendId(id)) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(id))
    }
}

pub async fn preview_route(
    State(state): State<AdminState>,
    Query(query): Query<RouteQuery>,
) -> Result<Json<BackendView>, ApiError> {
    let scope = PoolQuery {
        service: query.service,
    };
    Ok(Json(state.pool(&scope)?.preview_route(&query.key)?))
}

pub async fn configure(
    State(state): State<AdminState>,
    Query(scope): Query<PoolQuery>,
    Json(req): Json<ConfigureRequest>,
) -> Result<StatusCode, ApiError> {
    state.pool(&scope)?.reconfigure(|tuning| {
        if let Some(algorithm) = req.algorithm {
            tuning.algorithm = algorithm;
        }
        if let Some(secs) = req.health_interval_secs {
            tuning.health_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = req.health_timeout_ms {
            tuning.health_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = req.failure_threshold {
            tuning.failure_threshold = n;
        }
        if let Some(n) = req.success_threshold {
            tuning.success_threshold = n;
        }
    })?;
    Ok(StatusCode::NO_CONTENT)
}
