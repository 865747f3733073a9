//! quorumlite -- Raft-replicated SQL database server.
//!
//! Crash-only design: every startup is a recovery.  The log store is
//! reopened, the state machine restored from the latest snapshot, and
//! committed entries are re-applied as the commit index is learned.
//! SIGTERM/SIGINT only stop accepting connections and stop the
//! consensus task.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use quorumlite::cluster::transport::HttpTransport;
use quorumlite::config::Config;

/// Command-line arguments for the quorumlite server.
#[derive(Parser, Debug)]
#[command(
    name = "quorumlite",
    version,
    about = "Raft-replicated SQL database server"
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "quorumlite.example.yaml")]
    config: String,

    /// Override the bind address (host:port).
    #[arg(short, long)]
    bind: Option<String>,

    /// Override `node.id`.
    #[arg(long)]
    node_id: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = quorumlite::config::load_config(&cli.config)?;
    if let Some(id) = cli.node_id {
        config.node.id = id;
        config.validate()?;
    }
    init_tracing(&config);
    info!("Loaded configuration from {}", cli.config);

    let bind_addr = cli.bind.unwrap_or_else(|| config.bind_address());

    if config.observability.metrics {
        quorumlite::metrics::init_metrics();
        quorumlite::metrics::describe_metrics();
        info!("Prometheus metrics initialized");
    }

    let transport = HttpTransport::new(Duration::from_millis(config.cluster.election_timeout_ms))?;
    let shutdown_timeout = Duration::from_secs(config.server.shutdown_timeout);
    let node_id = config.node.id;
    let state = quorumlite::start_node(config, Arc::new(transport))?;
    let raft = state.raft.clone();

    let app = quorumlite::server::app(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(id = node_id, "quorumlite listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if tokio::time::timeout(shutdown_timeout, raft.shutdown())
        .await
        .is_err()
    {
        warn!("consensus task did not stop within {:?}", shutdown_timeout);
    }
    info!("quorumlite shut down");

    Ok(())
}

/// `RUST_LOG` wins over `logging.level`; `logging.format` picks text or json.
fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {err}");
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
                warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down");
        },
    }
}
