use thiserror::Error;

#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid digest: {0}")]
    InvalidDigest(String),

    #[error("Invalid hex encoding: {0}")]
    Hex(#[from] hex::FromHexError),
}

pub type Result<T> = std::result::Result<T, FingerprintError>;
