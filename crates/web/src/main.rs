//! Fossorial control plane daemon

use clap::Parser;
use fossorial_web::config::ServerConfig;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "fossoriald")]
#[command(about = "Fossorial site, resource and peer control plane")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "FOSSORIAL_CONFIG")]
    config: Option<PathBuf>,

    /// HTTP listen address (overrides config)
    #[arg(short, long, env = "FOSSORIAL_LISTEN")]
    listen: Option<String>,

    /// SQLite database path (overrides config)
    #[arg(long, env = "FOSSORIAL_DB")]
    db: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    info!("Fossorial v{}", fossorial_common::VERSION);

    let config_path = cli
        .config
        .unwrap_or_else(fossorial_common::default_config_path);
    let mut config = ServerConfig::load(&config_path)?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    fossorial_web::server::serve(config).await
}
