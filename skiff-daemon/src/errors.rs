use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] skiff_crypto::CryptoError),

    #[error("Transport error: {0}")]
    Transport(#[from] skiff_quic::TransportError),

    #[error("Watch error: {0}")]
    Watch(#[from] skiff_watch::WatchError),

    #[error("Audit error: {0}")]
    Audit(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
