//! Kubernetes Volume Broker
//!
//! Serves the Open Service Broker API for CSI-backed Kubernetes volumes.
//!
//! ```text
//! ┌──────────────┐   OSB v2    ┌──────────────┐  PV / PVC   ┌──────────────┐
//! │  Marketplace │ ──────────► │    Broker    │ ──────────► │  Kubernetes  │
//! └──────────────┘             └──────┬───────┘             └──────────────┘
//!                                     │ snapshot
//!                              ┌──────┴───────┐
//!                              │  State file  │
//!                              └──────────────┘
//! ```

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use k8s_volume_broker::metrics::run_metrics_server;
use k8s_volume_broker::{
    ApiServer, ApiServerConfig, Broker, BrokerConfig, BrokerCredentials, BrokerMetrics,
    KubeGateway, ServicesRegistry, SnapshotStore, StoreBackend,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Kubernetes Volume Broker - Open Service Broker for CSI-backed volumes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Marketplace API bind address
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8999")]
    listen_addr: SocketAddr,

    /// Directory holding the state snapshot; state is kept in memory only when unset
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Services config file (JSON, or YAML with a .yaml/.yml extension)
    #[arg(long, env = "SERVICES_CONFIG")]
    services_config: PathBuf,

    /// Kubeconfig file; in-cluster or default configuration is inferred when unset
    #[arg(long, env = "KUBECONFIG")]
    kube_config: Option<PathBuf>,

    /// Namespace claims are created in
    #[arg(long, env = "KUBE_NAMESPACE", default_value = "opi")]
    kube_namespace: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Basic-auth username for the marketplace API
    #[arg(long, env = "USERNAME", hide_env_values = true)]
    username: Option<String>,

    /// Basic-auth password for the marketplace API
    #[arg(long, env = "PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn credentials(&self) -> Option<BrokerCredentials> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) if !username.is_empty() => Some(BrokerCredentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    fn store_backend(&self) -> StoreBackend {
        match &self.data_dir {
            Some(dir) => StoreBackend::in_data_dir(dir),
            None => StoreBackend::InMemory,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args)?;

    info!("Starting Kubernetes Volume Broker");
    info!("  Version: {}", k8s_volume_broker::VERSION);
    info!("  Listen: {}", args.listen_addr);
    info!("  Namespace: {}", args.kube_namespace);

    let registry = ServicesRegistry::from_file(&args.services_config).with_context(|| {
        format!(
            "failed to load services config {}",
            args.services_config.display()
        )
    })?;

    let backend = args.store_backend();
    if backend == StoreBackend::InMemory {
        warn!("No data directory configured; broker state will not survive a restart");
    }

    let client = kube_client(args.kube_config.as_deref()).await?;

    let broker = Broker::new(
        BrokerConfig {
            namespace: args.kube_namespace.clone(),
            ..Default::default()
        },
        Arc::new(SnapshotStore::new(backend)),
        Arc::new(KubeGateway::new(client)),
        Arc::new(registry),
    )
    .await
    .context("failed to initialize broker")?;

    let metrics = BrokerMetrics::new()?;
    {
        let metrics = metrics.clone();
        let addr = args.metrics_addr;
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let credentials = args.credentials();
    if credentials.is_none() {
        warn!("USERNAME/PASSWORD not set; the broker API is unauthenticated");
    }

    let api_server = Arc::new(ApiServer::new(
        ApiServerConfig {
            listen_addr: args.listen_addr,
            credentials,
        },
        broker,
        metrics,
    ));

    {
        let api_server = api_server.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            api_server.shutdown();
        });
    }

    api_server.run().await?;

    info!("Broker shutdown complete");
    Ok(())
}

// =============================================================================
// Kubernetes Client
// =============================================================================

async fn kube_client(kubeconfig: Option<&Path>) -> anyhow::Result<kube::Client> {
    use kube::config::{KubeConfigOptions, Kubeconfig};

    let config = match kubeconfig {
        Some(path) => {
            info!("  Kubeconfig: {}", path.display());
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("invalid kubeconfig")?
        }
        None => kube::Config::infer()
            .await
            .context("failed to infer Kubernetes configuration")?,
    };

    kube::Client::try_from(config).context("failed to create Kubernetes client")
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&args.log_level)
            .with_context(|| format!("invalid log level {}", args.log_level))?,
    }
    .add_directive("hyper=warn".parse()?)
    .add_directive("kube=info".parse()?)
    .add_directive("tower=warn".parse()?)
    .add_directive("axum=info".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }

    Ok(())
}

// =============================================================================
// Shutdown
// =============================================================================

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
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
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
