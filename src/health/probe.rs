//! Single health probe against one backend.
//!
//! Every probe is bounded by a timeout. Errors never leave this module: they
//! are logged and turned into a failure result.

use std::time::{Duration, Instant};

use axum::body::Body;
use hyper::Request;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::net::TcpStream;
use tokio::time;

use crate::health::state::HealthCheckResult;

/// How a backend is probed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProbeKind {
    /// Successful TCP connect.
    #[default]
    Tcp,
    /// GET `path`; any response below 500 counts as alive.
    Http { path: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("http request failed: {0}")]
    Http(#[from] hyper_util::client::legacy::Error),

    #[error("invalid probe request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("unhealthy status {0}")]
    Status(u16),
}

#[derive(Clone)]
pub struct Prober {
    client: Client<HttpConnector, Body>,
}

impl std::fmt::Debug for Prober {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prober").finish_non_exhaustive()
    }
}

impl Default for Prober {
    fn default() -> Self {
        Self::new()
    }
}

impl Prober {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { client }
    }

    /// Probe `addr` (`host:port`) once.
    pub async fn probe(&self, addr: &str, kind: &ProbeKind, timeout: Duration) -> HealthCheckResult {
        let start = Instant::now();
        let attempt = async {
            match kind {
                ProbeKind::Tcp => self.tcp(addr).await,
                ProbeKind::Http { path } => self.http(addr, path).await,
            }
        };

        let outcome = match time::timeout(timeout, attempt).await {
            Ok(inner) => inner,
            Err(_) => Err(ProbeError::Timeout(timeout)),
        };

        match outcome {
            Ok(()) => HealthCheckResult::success(Some(start.elapsed())),
            Err(e) => {
                tracing::debug!(addr = %addr, error = %e, "Health probe failed");
                HealthCheckResult::failure()
            }
        }
    }

    async fn tcp(&self, addr: &str) -> Result<(), ProbeError> {
        let _stream = TcpStream::connect(addr).await?;
        Ok(())
    }

    async fn http(&self, addr: &str, path: &str) -> Result<(), ProbeError> {
        let request = Request::builder()
            .method("GET")
            .uri(format!("http://{}{}", addr, path))
            .header("user-agent", "dispatch-engine-health-check")
            .body(Body::empty())?;

        let response = self.client.request(request).await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(ProbeError::Status(status.as_u16()));
        }
        Ok(())
    }
}
