use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Certificate generation failed: {0}")]
    CertificateGeneration(String),

    #[error("Certificate validation failed: {0}")]
    CertificateValidation(String),

    #[error("Trust store error: {0}")]
    TrustStore(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
