//! Edge Orchestrator CLI entry point.
//!
//! Loads a configuration file, starts the engine behind the front door and
//! serves until interrupted.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edge_orchestrator_common::ConfigFile;
use edge_orchestrator_server::Orchestrator;

#[derive(Debug, Parser)]
#[command(name = "edge-orchestrator", version, about)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "EDGE_ORCHESTRATOR_CONFIG")]
    config: PathBuf,

    /// Override the host to listen on.
    #[arg(long)]
    host: Option<String>,

    /// Override the port to listen on.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,edge_orchestrator=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let ConfigFile {
        orchestrator: mut config,
        workers,
    } = ConfigFile::from_file(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    info!(workers = workers.len(), "Starting Edge Orchestrator");

    let orchestrator = Orchestrator::new(config, workers)
        .await
        .context("Invalid worker configuration")?;

    match orchestrator.ready().await {
        Ok(url) => info!(%url, "Ready"),
        Err(err) => {
            orchestrator.dispose().await;
            return Err(err).context("Engine failed to start");
        }
    }

    shutdown_signal().await;
    info!("Shutting down");
    orchestrator.dispose().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to install signal handler");
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
}
