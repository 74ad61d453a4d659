//! camwall-server binary

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use camwall_server::{Cli, IngestServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ServerConfig::load(&cli).context("Failed to load configuration")?;

    if cli.print_config {
        print!("{}", config.to_toml().context("Failed to serialize configuration")?);
        return Ok(());
    }

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting camwall-server {}", env!("CARGO_PKG_VERSION"));

    let server = IngestServer::new(config)?;
    if let Err(e) = server.run().await {
        error!("Server error: {:#}", e);
        return Err(e);
    }

    Ok(())
}
