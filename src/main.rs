//! dispatch-engine service binary.
//!
//! ```text
//!     Client Request ──▶ proxy listener ──▶ ServiceRouter ──▶ DispatchEngine ──▶ Backend
//!                                                               ▲      ▲
//!                        admin API ─────────────────────────────┘      │
//!                        health checkers (one per pool) ───────────────┘
//!                        config watcher ──▶ apply_config
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use dispatch_engine::admin::{setup_admin_router, AdminState};
use dispatch_engine::config::{load_config, ConfigWatcher, DispatchConfig};
use dispatch_engine::http::HttpServer;
use dispatch_engine::lifecycle::{shutdown_signal, Shutdown};
use dispatch_engine::observability::{logging, metrics};
use dispatch_engine::routing::ServiceRouter;

#[derive(Parser)]
#[command(name = "dispatch-engine")]
#[command(about = "Health-aware backend dispatch engine", long_about = None)]
struct Args {
    /// Path to the TOML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => DispatchConfig::default(),
    };

    logging::init(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "dispatch-engine starting");

    if config.observability.metrics_enabled {
        let addr: SocketAddr = config.observability.metrics_address.parse()?;
        metrics::init_metrics(addr);
    }

    let router = Arc::new(ServiceRouter::from_config(&config)?);
    tracing::info!(
        algorithm = %config.balancing.algorithm,
        backends = config.backends.len(),
        services = config.services.len(),
        "Engine initialized"
    );

    let shutdown = Shutdown::new();
    let health = router.spawn_health_checkers(&shutdown);

    // Keep the watcher handle alive for the lifetime of the process.
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let handle = watcher.run()?;
            let router = router.clone();
            tokio::spawn(async move {
                while let Some(new_config) = updates.recv().await {
                    if let Err(e) = router.apply_config(&new_config) {
                        tracing::error!(error = %e, "Failed to apply reloaded config");
                    }
                }
            });
            Some(handle)
        }
        None => None,
    };

    let admin = if config.admin.enabled {
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        tracing::info!(address = %listener.local_addr()?, "Admin API listening");
        let app = setup_admin_router(AdminState::with_router(
            router.clone(),
            config.admin.api_key.clone(),
        ));
        let mut stop = shutdown.subscribe();
        Some(tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = stop.recv().await;
                })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "Admin API failed");
            }
        }))
    } else {
        None
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    let server = HttpServer::with_router(
        router.clone(),
        Duration::from_secs(config.timeouts.request_secs),
    );
    let proxy = tokio::spawn(server.run(listener, shutdown.subscribe()));

    shutdown_signal().await;
    shutdown.trigger();

    if let Err(e) = proxy.await? {
        tracing::error!(error = %e, "Proxy server failed");
    }
    if let Some(admin) = admin {
        admin.await?;
    }
    for checker in health {
        checker.await?;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
