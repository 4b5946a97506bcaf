use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use session_mesh_server::config::{NodeConfig, NodeRole};
use session_mesh_server::metrics::{self, NodeMetrics};
use session_mesh_server::node::{MasterRuntime, SlaveRuntime};

#[derive(Parser, Debug)]
#[command(name = "session-mesh-server", version, about = "Master/slave multiplayer session server")]
struct Args {
    /// Path to the node's JSON configuration file
    config: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let args = Args::parse();

    info!("Session Mesh Server v{}", env!("CARGO_PKG_VERSION"));

    let config = match NodeConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error in {}: {}", args.config.display(), e);
            std::process::exit(1);
        }
    };
    info!(
        "Configuration loaded: {} node {} on {}:{}",
        config.role.as_str(),
        config.node_id,
        config.bind_address,
        config.tcp_port
    );

    let metrics = Arc::new(NodeMetrics::new(config.role.as_str()));

    #[cfg(feature = "metrics_http")]
    if let Some(port) = config.metrics_port {
        let metrics = metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(metrics, port).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let server = async {
        match config.role {
            NodeRole::Master => MasterRuntime::bind(&config, metrics.clone()).await?.run().await,
            NodeRole::Slave => SlaveRuntime::bind(&config, metrics.clone()).await?.run().await,
        }
    };

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!("Server error: {:#}", e);
                return Err(e);
            }
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
        }
    }

    info!("Server stopped");
    Ok(())
}
