use quinn::Endpoint;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;
use tracing::{debug, info};

use skiff_crypto::{DeviceIdentity, HarborVerifier, HostKeyPolicy, KnownHosts};
use skiff_fingerprint::Fingerprint;

use crate::config::QuicSettings;
use crate::errors::{Result, TransportError};
use crate::protocol::{WireMessage, TRANSFER_CHUNK_SIZE};

/// Client that pushes one file per call to the configured harbor.
///
/// Each `send` establishes a fresh mTLS QUIC session, streams the file on a
/// bidirectional stream and closes the session whether or not the transfer
/// succeeded. Host identity is checked by the [`HarborVerifier`] baked into
/// the TLS configuration, so a pinning violation surfaces as
/// [`TransportError::Auth`] before any bytes leave the machine.
pub struct TransportClient {
    endpoint: Endpoint,
    remote_host: String,
    remote_port: u16,
    settings: QuicSettings,
}

impl TransportClient {
    /// Create a client for a single remote harbor.
    ///
    /// `known_hosts` and `policy` decide how an unknown or changed harbor
    /// identity is treated; see [`HostKeyPolicy`].
    pub fn new(
        identity: Arc<DeviceIdentity>,
        remote_host: impl Into<String>,
        remote_port: u16,
        policy: HostKeyPolicy,
        known_hosts: KnownHosts,
        settings: QuicSettings,
    ) -> Result<Self> {
        let remote_host = remote_host.into();
        let harbor_endpoint = format!("{}:{}", remote_host, remote_port);
        let verifier = Arc::new(HarborVerifier::new(harbor_endpoint, policy, known_hosts));

        let client_config = settings.build_client_config(&identity, verifier)?;

        let bind_addr: SocketAddr = "0.0.0.0:0"
            .parse()
            .map_err(|e| TransportError::Config(format!("Invalid bind address: {}", e)))?;
        let mut endpoint = Endpoint::client(bind_addr)
            .map_err(|e| TransportError::Config(format!("Failed to create endpoint: {}", e)))?;
        endpoint.set_default_client_config(client_config);

        debug!("Transport client initialized for {}:{}", remote_host, remote_port);

        Ok(Self {
            endpoint,
            remote_host,
            remote_port,
            settings,
        })
    }

    /// Push a local file to a harbor-relative destination path.
    ///
    /// `digest` is the fingerprint of the file's stable content; the harbor
    /// re-hashes what it receives and refuses to store a mismatch.
    pub async fn send(&self, local_path: &Path, dest_path: &str, digest: &Fingerprint) -> Result<()> {
        let addr = self.resolve().await?;

        debug!("Connecting to {} ({})", self.remote_host, addr);
        let connecting = self.endpoint.connect(addr, &self.remote_host)?;
        let connection = timeout(self.settings.connect_timeout, connecting)
            .await
            .map_err(|_| TransportError::Network("Connect timed out".to_string()))??;

        let result = self
            .transfer(&connection, local_path, dest_path, digest)
            .await;

        // The session never outlives the call, success or not
        connection.close(0u32.into(), b"done");

        if result.is_ok() {
            info!(
                "Uploaded {} to {}:{}",
                local_path.display(),
                self.remote_host,
                dest_path
            );
        }
        result
    }

    async fn resolve(&self) -> Result<SocketAddr> {
        let mut addrs = tokio::net::lookup_host((self.remote_host.as_str(), self.remote_port))
            .await
            .map_err(|e| TransportError::Network(format!("Failed to resolve host: {}", e)))?;
        addrs.next().ok_or_else(|| {
            TransportError::Network(format!(
                "No addresses for {}:{}",
                self.remote_host, self.remote_port
            ))
        })
    }

    async fn transfer(
        &self,
        connection: &quinn::Connection,
        local_path: &Path,
        dest_path: &str,
        digest: &Fingerprint,
    ) -> Result<()> {
        let (mut send, mut recv) = connection.open_bi().await?;

        let size = tokio::fs::metadata(local_path).await?.len();

        let request = WireMessage::UploadRequest {
            dest_path: dest_path.to_string(),
            size,
            digest: digest.to_hex(),
        };
        request.send(&mut send).await?;

        match WireMessage::receive(&mut recv).await? {
            WireMessage::UploadResponse { accepted: true, .. } => {
                debug!("Upload accepted for {}", dest_path);
            }
            WireMessage::UploadResponse {
                accepted: false,
                reason,
            } => {
                let reason = reason.unwrap_or_else(|| "unspecified".to_string());
                return Err(TransportError::RemoteWrite(format!(
                    "Upload rejected: {}",
                    reason
                )));
            }
            other => {
                return Err(TransportError::Network(format!(
                    "Unexpected response to upload request: {:?}",
                    other
                )))
            }
        }

        // Stream the payload in fixed-size chunks
        let mut file = File::open(local_path).await?;
        let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];
        let mut sent = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            send.write_all(&buf[..n]).await?;
            sent += n as u64;
        }

        if sent != size {
            // The file changed underneath us after stabilization
            return Err(TransportError::Network(format!(
                "Source file changed during send: declared {} bytes, read {}",
                size, sent
            )));
        }

        send.finish()
            .map_err(|e| TransportError::Network(format!("Failed to finish stream: {}", e)))?;

        match WireMessage::receive(&mut recv).await? {
            WireMessage::UploadComplete {
                stored: true,
                digest_ok: true,
                ..
            } => Ok(()),
            WireMessage::UploadComplete { message, .. } => {
                Err(TransportError::RemoteWrite(message))
            }
            other => Err(TransportError::Network(format!(
                "Unexpected response to upload: {:?}",
                other
            ))),
        }
    }

    /// Gracefully shut down the client endpoint.
    pub fn shutdown(&self) {
        self.endpoint.close(0u32.into(), b"client shutdown");
        debug!("Transport client shutdown");
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}
