use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use skiff_daemon::config::SkiffConfig;
use skiff_daemon::daemon::Daemon;

#[derive(Parser, Debug)]
#[command(name = "skiff-daemon")]
#[command(about = "Watches a drop directory and ferries new files to a remote harbor")]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "skiff.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("Crypto provider already installed");
    }

    let args = Args::parse();
    let config = SkiffConfig::load(&args.config)?;

    let handle = Daemon::start(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    handle.stop().await?;
    Ok(())
}
