//! Control plane server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use super::router::{AppState, create_router};
use crate::config::Config;
use crate::plane::ResiliencePlane;
use crate::{Error, Result};

/// Resilience plane server
pub struct Server {
    /// Configuration
    config: Config,
    /// Control plane shared with request handlers
    plane: Arc<ResiliencePlane>,
}

impl Server {
    /// Create a server sampling the local host
    #[must_use]
    pub fn new(config: Config) -> Self {
        let plane = Arc::new(ResiliencePlane::new(config.clone()));
        Self { config, plane }
    }

    /// Run until Ctrl+C or SIGTERM
    ///
    /// # Errors
    ///
    /// Returns an error if the address is invalid, the port cannot be
    /// bound, or the HTTP server fails.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
        let tasks = self.plane.start(&shutdown_tx);

        let admin_token = self.config.server.resolve_admin_token();
        #[allow(unused_mut)]
        let mut state = AppState::new(Arc::clone(&self.plane), admin_token.clone());
        #[cfg(feature = "metrics")]
        {
            match crate::telemetry::install_prometheus() {
                Ok(handle) => state.prometheus = Some(handle),
                Err(e) => warn!(error = %e, "Prometheus exporter unavailable"),
            }
        }
        let app = create_router(Arc::new(state));

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("RESILIENCE PLANE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(
            "  GET  http://{}:{}/health",
            self.config.server.host, self.config.server.port
        );
        if admin_token.is_some() {
            info!("ADMIN endpoints require a bearer token");
        } else {
            warn!("ADMIN endpoints are unauthenticated - set server.admin_token");
        }
        if !self.config.monitor.enabled {
            warn!("Resource monitor disabled - degradation only via admin API");
        }
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        let drain = futures::future::join_all(tasks);
        if tokio::time::timeout(self.config.server.shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!("Background tasks did not stop within the shutdown timeout");
        }
        info!("Shutdown complete");

        Ok(())
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
