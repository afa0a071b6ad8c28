use quinn::{ClientConfig, ServerConfig, TransportConfig};
use std::sync::Arc;
use std::time::Duration;

use skiff_crypto::certificate::TlsConfig;
use skiff_crypto::{CertificateGenerator, DeviceIdentity, DropVerifier, HarborVerifier};

use crate::errors::{Result, TransportError};

/// QUIC tuning knobs shared by the client and the harbor.
#[derive(Debug, Clone)]
pub struct QuicSettings {
    /// Timeout for connection establishment
    pub connect_timeout: Duration,

    /// Maximum idle timeout
    pub idle_timeout: Duration,

    /// Keep-alive interval
    pub keep_alive_interval: Duration,

    /// Stream receive window
    pub stream_receive_window: u64,

    /// Connection receive window
    pub receive_window: u64,
}

impl Default for QuicSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(10),
            stream_receive_window: 8 * 1024 * 1024,  // 8MB
            receive_window: 32 * 1024 * 1024,        // 32MB
        }
    }
}

impl QuicSettings {
    fn build_transport_config(&self) -> Result<TransportConfig> {
        let mut transport = TransportConfig::default();

        transport.max_idle_timeout(Some(self.idle_timeout.try_into().map_err(|_| {
            TransportError::Config("Idle timeout out of range".to_string())
        })?));
        transport.keep_alive_interval(Some(self.keep_alive_interval));
        transport.stream_receive_window(self.stream_receive_window.try_into().map_err(|_| {
            TransportError::Config("Stream receive window out of range".to_string())
        })?);
        transport.receive_window(self.receive_window.try_into().map_err(|_| {
            TransportError::Config("Receive window out of range".to_string())
        })?);

        Ok(transport)
    }

    /// Build a Quinn client configuration authenticating as `identity` and
    /// verifying the harbor through `verifier`.
    pub fn build_client_config(
        &self,
        identity: &DeviceIdentity,
        verifier: Arc<HarborVerifier>,
    ) -> Result<ClientConfig> {
        let (cert_chain, private_key) = CertificateGenerator::generate_device_certificate(identity)?;
        let tls_config = TlsConfig::client_config(cert_chain, private_key, verifier)?;

        let crypto_config = quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
            .map_err(|e| TransportError::Config(format!("Failed to create QUIC client config: {}", e)))?;
        let mut config = ClientConfig::new(Arc::new(crypto_config));
        config.transport_config(Arc::new(self.build_transport_config()?));

        Ok(config)
    }

    /// Build a Quinn server configuration requiring sender certificates.
    pub fn build_server_config(
        &self,
        identity: &DeviceIdentity,
        verifier: Arc<DropVerifier>,
    ) -> Result<ServerConfig> {
        let (cert_chain, private_key) = CertificateGenerator::generate_device_certificate(identity)?;
        let tls_config = TlsConfig::server_config(cert_chain, private_key, verifier)?;

        let crypto_config = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
            .map_err(|e| TransportError::Config(format!("Failed to create QUIC server config: {}", e)))?;
        let mut config = ServerConfig::with_crypto(Arc::new(crypto_config));
        config.transport_config(Arc::new(self.build_transport_config()?));

        Ok(config)
    }
}
