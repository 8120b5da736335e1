//! Server lifecycle management
//!
//! Starts the background tasks and the HTTP server, then tears everything
//! down in order once a shutdown signal arrives.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use tsrelay_core::Config;
use tsrelay_livestream::events::{EventHandler, EventListener};
use tsrelay_livestream::ChannelCoordinator;

pub struct RelayServer {
    config: Config,
    coordinator: Arc<ChannelCoordinator>,
}

impl RelayServer {
    pub const fn new(config: Config, coordinator: Arc<ChannelCoordinator>) -> Self {
        Self { config, coordinator }
    }

    /// Start all components and wait for a shutdown signal
    pub async fn start(self) -> anyhow::Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Cross-worker control events
        let handler: Arc<dyn EventHandler> = self.coordinator.clone();
        let listener = EventListener::new(
            self.coordinator.context().store.clone(),
            handler,
            self.coordinator.shutdown_token(),
        )
        .spawn();
        info!("Event listener started");

        // Heartbeats, lock renewal and idle cleanup
        let maintenance = tokio::spawn(self.coordinator.clone().run_maintenance());
        info!("Maintenance loop started");

        let http_handle = self.start_http_server(shutdown_rx).await?;
        info!("All components started successfully");

        tokio::select! {
            _ = http_handle => {
                error!("HTTP server stopped unexpectedly");
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
        }

        let _ = shutdown_tx.send(true);

        // Cancels the listener and maintenance loop, then stops local channels
        self.coordinator.shutdown().await;
        let _ = listener.await;
        let _ = maintenance.await;

        info!("tsrelay shut down complete");
        Ok(())
    }

    /// Bind and serve the HTTP router with graceful shutdown support
    async fn start_http_server(&self, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<JoinHandle<()>> {
        let http_address = self.config.http_address();
        let http_addr: SocketAddr = http_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid HTTP address '{http_address}': {e}"))?;
        let listener = tokio::net::TcpListener::bind(http_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_addr}: {e}"))?;
        info!("HTTP server listening on {}", http_addr);

        let router = tsrelay_api::create_router(self.coordinator.clone());

        let handle = tokio::spawn(async move {
            let mut rx = shutdown_rx;
            let graceful = async move {
                let _ = rx.changed().await;
            };

            if let Err(e) = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(graceful)
            .await
            {
                error!("HTTP server error: {}", e);
            }

            info!("HTTP server shut down gracefully");
        });

        Ok(handle)
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
