//! HTTP server setup and request forwarding.
//!
//! # Responsibilities
//! - Create the Axum Router and wire up middleware (tracing, request ID)
//! - Pick the service pool from the Host header
//! - Derive a request key for every request and route it through that pool
//! - Forward the request to the chosen backend, addressed by its own authority
//! - Report the upstream outcome back so passive health sees it
//!
//! The request key is the first `X-Forwarded-For` entry, then `X-Real-IP`,
//! then the peer address.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{
        header::{self, HeaderMap, HeaderName, HeaderValue},
        uri::{Authority, Scheme},
        Request, StatusCode, Uri, Version,
    },
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::engine::DispatchEngine;
use crate::health::passive::RequestOutcome;
use crate::load_balancer::DispatchError;
use crate::routing::ServiceRouter;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";
const X_FORWARDED_HOST: &str = "x-forwarded-host";

/// Connection-scoped headers that must not be forwarded.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<ServiceRouter>,
    pub client: Client<HttpConnector, Body>,
    pub request_timeout: Duration,
}

/// HTTP server for the forwarding proxy.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    /// Proxy in front of a single pool.
    pub fn new(engine: Arc<DispatchEngine>, request_timeout: Duration) -> Self {
        Self::with_router(Arc::new(ServiceRouter::single(engine)), request_timeout)
    }

    pub fn with_router(router: Arc<ServiceRouter>, request_timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let state = AppState {
            router,
            client,
            request_timeout,
        };
        Self {
            router: Self::build_router(state),
        }
    }

    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(state)
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::x_request_id()),
            )
    }

    /// Serve until the shutdown signal fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "Proxy server starting");

        let app = self
            .router
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        tracing::info!("Proxy server stopped");
        Ok(())
    }
}

/// Routing key for a request.
pub fn client_key(headers: &HeaderMap, peer: SocketAddr) -> String {
    let forwarded = headers
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(first) = forwarded {
        return first.to_string();
    }

    let real_ip = headers
        .get(X_REAL_IP)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    if let Some(ip) = real_ip {
        return ip.to_string();
    }

    peer.ip().to_string()
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in `Connection` are connection-scoped too.
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_str(name.trim()).ok())
        .collect();
    for name in named.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

/// Host the client addressed: the `Host` header, else the URI authority
/// (HTTP/2 requests carry it there).
fn requested_host<'a>(headers: &'a HeaderMap, uri: &'a Uri) -> Option<&'a str> {
    headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| uri.authority().map(Authority::as_str))
}

/// Address the backend by its own authority, keeping the client's Host in
/// `X-Forwarded-Host` unless an earlier proxy already set it.
fn rewrite_host(headers: &mut HeaderMap, original: Option<&str>, backend: &str) {
    if !headers.contains_key(X_FORWARDED_HOST) {
        if let Some(value) = original.and_then(|h| HeaderValue::from_str(h).ok()) {
            headers.insert(X_FORWARDED_HOST, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(backend) {
        headers.insert(header::HOST, value);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, peer: SocketAddr) {
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, peer.ip()),
        None => peer.ip().to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

fn upstream_uri(original: &Uri, address: &str) -> Result<Uri, axum::http::Error> {
    let mut parts = original.clone().into_parts();
    parts.scheme = Some(Scheme::HTTP);
    parts.authority = Some(Authority::from_str(address)?);
    if parts.path_and_query.is_none() {
        parts.path_and_query = Some("/".parse()?);
    }
    Ok(Uri::from_parts(parts)?)
}

/// Main proxy handler: route, forward, report.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let key = client_key(request.headers(), peer);
    let host = requested_host(request.headers(), request.uri()).map(str::to_string);
    let (service, engine) = state.router.resolve(host.as_deref());

    let lease = match engine.route_lease(&key) {
        Ok(lease) => lease,
        Err(DispatchError::NoHealthyBackend) => {
            tracing::warn!(key = %key, service, "No healthy backend");
            return (StatusCode::SERVICE_UNAVAILABLE, "No healthy backends").into_response();
        }
        Err(e) => {
            tracing::error!(key = %key, service, error = %e, "Routing failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Routing failed").into_response();
        }
    };
    let addr = lease.address();

    let (mut parts, body) = request.into_parts();
    parts.uri = match upstream_uri(&parts.uri, &addr) {
        Ok(uri) => uri,
        Err(e) => {
            tracing::error!(backend = %addr, error = %e, "Cannot build upstream URI");
            lease.finish(RequestOutcome::Failure);
            return (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response();
        }
    };
    // Upstream connections are plain HTTP/1.1.
    parts.version = Version::HTTP_11;
    strip_hop_by_hop(&mut parts.headers);
    append_forwarded_for(&mut parts.headers, peer);
    rewrite_host(&mut parts.headers, host.as_deref(), &addr);

    tracing::debug!(
        key = %key,
        service,
        backend_id = %lease.id(),
        backend = %addr,
        method = %parts.method,
        path = %parts.uri.path(),
        "Forwarding request"
    );

    let upstream = Request::from_parts(parts, body);
    match tokio::time::timeout(state.request_timeout, state.client.request(upstream)).await {
        Ok(Ok(response)) => {
            let status = response.status();
            let outcome = RequestOutcome::from_status(status.as_u16(), lease.elapsed());
            tracing::debug!(backend = %addr, status = %status, outcome = outcome.label(), "Upstream responded");
            lease.finish(outcome);

            let (mut parts, body) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            Response::from_parts(parts, Body::new(body))
        }
        Ok(Err(e)) => {
            tracing::error!(backend = %addr, error = %e, "Upstream error");
            lease.finish(RequestOutcome::Failure);
            (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response()
        }
        Err(_) => {
            tracing::error!(backend = %addr, timeout = ?state.request_timeout, "Upstream timed out");
            lease.finish(RequestOutcome::Timeout);
            (StatusCode::GATEWAY_TIMEOUT, "Upstream timed out").into_response()
        }
    }
}
