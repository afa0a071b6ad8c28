use thiserror::Error;

/// Transfer failures, split by what the caller should do about them.
///
/// `Auth` means the remote rejected our credentials or its identity failed
/// verification; retrying cannot help. `Network` covers transient transport
/// failures and is the only retryable kind. `RemoteWrite` means the harbor
/// accepted the connection but refused or failed to store the file.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Remote write failed: {0}")]
    RemoteWrite(String),

    #[error("Transport configuration error: {0}")]
    Config(String),
}

impl TransportError {
    /// Whether a retry with backoff has any chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Network(_))
    }
}

/// QUIC CRYPTO_ERROR codes carry TLS alerts (0x0100-0x01ff); anything in that
/// range means the handshake itself was rejected, not that the link dropped.
fn is_tls_failure(code: u64) -> bool {
    (0x100..=0x1ff).contains(&code)
}

impl From<quinn::ConnectionError> for TransportError {
    fn from(err: quinn::ConnectionError) -> Self {
        match &err {
            quinn::ConnectionError::TransportError(te) if is_tls_failure(u64::from(te.code)) => {
                TransportError::Auth(err.to_string())
            }
            quinn::ConnectionError::ConnectionClosed(close)
                if is_tls_failure(u64::from(close.error_code)) =>
            {
                TransportError::Auth(err.to_string())
            }
            _ => TransportError::Network(err.to_string()),
        }
    }
}

impl From<quinn::ConnectError> for TransportError {
    fn from(err: quinn::ConnectError) -> Self {
        TransportError::Network(err.to_string())
    }
}

impl From<quinn::WriteError> for TransportError {
    fn from(err: quinn::WriteError) -> Self {
        match err {
            quinn::WriteError::ConnectionLost(e) => e.into(),
            other => TransportError::Network(other.to_string()),
        }
    }
}

impl From<quinn::ReadExactError> for TransportError {
    fn from(err: quinn::ReadExactError) -> Self {
        match err {
            quinn::ReadExactError::ReadError(quinn::ReadError::ConnectionLost(e)) => e.into(),
            other => TransportError::Network(other.to_string()),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Network(err.to_string())
    }
}

impl From<skiff_crypto::CryptoError> for TransportError {
    fn from(err: skiff_crypto::CryptoError) -> Self {
        TransportError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_is_retryable() {
        assert!(TransportError::Network("reset".into()).is_retryable());
        assert!(!TransportError::Auth("bad cert".into()).is_retryable());
        assert!(!TransportError::RemoteWrite("disk full".into()).is_retryable());
        assert!(!TransportError::Config("no identity".into()).is_retryable());
    }

    #[test]
    fn test_tls_alert_range() {
        assert!(is_tls_failure(0x100));
        assert!(is_tls_failure(0x12a));
        assert!(is_tls_failure(0x1ff));
        assert!(!is_tls_failure(0x0));
        assert!(!is_tls_failure(0x200));
    }
}
