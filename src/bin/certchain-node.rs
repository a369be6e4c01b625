#![forbid(unsafe_code)]
//! CertChain node: HTTP API, periodic block sealing and peer resolution

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use certchain::api::run_api_server;
use certchain::config::{load_config, DEFAULT_CONFIG_FILE};
use certchain::node::CertNode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Override the listening port
    #[arg(long)]
    port: Option<u16>,

    /// Back up and reset the credit ledger (and the chain) on startup
    #[arg(long)]
    reset_ledger: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    if let Some(port) = cli.port {
        config.set_port(port);
    }
    if cli.reset_ledger {
        config.storage.reset_ledger = true;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        "Starting CertChain node {} (backend = {:?})",
        config.node.node_id, config.storage.backend
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], config.network.port));
    let node = CertNode::open(config)?;
    let tasks = node.spawn_background_tasks();

    let served = run_api_server(node.clone(), addr, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    })
    .await;

    for task in tasks {
        task.abort();
    }
    node.shutdown();

    served?;
    Ok(())
}
