//! API Server
//!
//! Binds the marketplace router and serves it until shutdown is requested.

use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::metrics::BrokerMetrics;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use super::rest::{BrokerCredentials, RestRouter};

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// Marketplace API bind address
    pub listen_addr: SocketAddr,
    /// Basic-auth credentials; `None` leaves the API open
    pub credentials: Option<BrokerCredentials>,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8999)),
            credentials: None,
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// Marketplace API server
pub struct ApiServer {
    config: ApiServerConfig,
    broker: Arc<Broker>,
    metrics: Arc<BrokerMetrics>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(config: ApiServerConfig, broker: Arc<Broker>, metrics: Arc<BrokerMetrics>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            broker,
            metrics,
            shutdown_tx,
        }
    }

    /// Serve until [`ApiServer::shutdown`] is called
    pub async fn run(&self) -> Result<()> {
        let app = RestRouter::new(self.broker.clone(), self.metrics.clone())
            .with_credentials(self.config.credentials.clone())
            .build();

        let listener = tokio::net::TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind API server: {}", e)))?;

        info!(
            addr = %self.config.listen_addr,
            basic_auth = self.config.credentials.is_some(),
            "Broker API listening"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Broker API shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("API server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
