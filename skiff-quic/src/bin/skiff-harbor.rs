//! Standalone harbor: listens for authenticated skiff uploads and stores them
//! under a root directory.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use skiff_crypto::{DeviceId, DeviceIdentity, DropVerifier};
use skiff_quic::{QuicSettings, UploadServer};

#[derive(Parser, Debug)]
#[command(name = "skiff-harbor")]
#[command(about = "Receives skiff file transfers over authenticated QUIC")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:9876")]
    bind: SocketAddr,

    /// Directory uploads are stored under
    #[arg(long, default_value = "./harbor")]
    root: PathBuf,

    /// Path to the harbor's identity key (generated if missing)
    #[arg(long)]
    identity: Option<PathBuf>,

    /// Device ID of a sender allowed to upload (repeatable). Without any,
    /// every authenticated sender is accepted.
    #[arg(long = "sender")]
    senders: Vec<String>,
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

    let identity = Arc::new(
        DeviceIdentity::load_or_generate("skiff-harbor", args.identity.as_deref()).await?,
    );

    let verifier = if args.senders.is_empty() {
        info!("Accepting uploads from any authenticated sender");
        Arc::new(DropVerifier::allow_any())
    } else {
        let mut allowed = Vec::with_capacity(args.senders.len());
        for raw in &args.senders {
            allowed.push(DeviceId::from_str(raw)?);
        }
        info!("Accepting uploads from {} pinned sender(s)", allowed.len());
        Arc::new(DropVerifier::new(allowed))
    };

    let mut server = UploadServer::new(
        identity,
        verifier,
        args.root,
        args.bind,
        QuicSettings::default(),
    );
    server.start().await?;

    tokio::select! {
        result = server.run() => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    server.stop();
    Ok(())
}
