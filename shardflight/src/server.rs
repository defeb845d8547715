//! Node lifecycle management
//!
//! Starts the Flight transport, waits for SIGINT/SIGTERM, then stops the
//! transport in reverse order of start.

use anyhow::Result;
use tracing::{error, info};

use shardflight_core::Config;
use shardflight_transport::FlightTransport;

pub struct NodeServer {
    config: Config,
    transport: FlightTransport,
}

impl NodeServer {
    pub async fn start(config: Config) -> Result<Self> {
        let transport = FlightTransport::start(&config)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to start flight transport: {e}"))?;
        info!(
            node_id = %transport.node_id(),
            address = %transport.local_addr(),
            "Node ready"
        );
        Ok(Self { config, transport })
    }

    pub async fn run_until_shutdown(self) {
        shutdown_signal().await;
        info!(
            node_id = %self.config.node.id,
            in_flight = self.transport.stream_manager().len(),
            "Shutdown signal received, starting graceful shutdown..."
        );
        self.transport.stop().await;
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
