use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use loom_core::{Config, NodeBuilder};

#[derive(Parser, Debug)]
#[command(name = "loom-meshd")]
#[command(about = "Loom Mesh node daemon", long_about = None)]
struct Args {
    /// Path to the node configuration file (TOML)
    #[arg(long)]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load(&args.config)
        .with_context(|| format!("Cannot load configuration from {:?}", args.config))?;

    info!(
        "Starting Loom Mesh node {} ({})",
        config.node_id,
        config.role.as_str()
    );

    let node = NodeBuilder::new(config).start().await?;
    info!("Node ready on https://{}", node.rpc_addr());

    node.run_until_signalled().await;

    Ok(())
}
