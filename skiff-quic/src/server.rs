use quinn::Endpoint;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use skiff_crypto::{DeviceIdentity, DropVerifier};
use skiff_fingerprint::Fingerprint;

use crate::config::QuicSettings;
use crate::errors::{Result, TransportError};
use crate::protocol::{WireMessage, TRANSFER_CHUNK_SIZE};

/// Receiving side of a skiff transfer: accepts authenticated uploads and
/// stores them under a root directory.
///
/// Files are written to a temporary sibling while the payload is re-hashed,
/// then atomically renamed into place, so a crashed or corrupt upload never
/// leaves a partial file at the destination path.
pub struct UploadServer {
    endpoint: Option<Endpoint>,
    identity: Arc<DeviceIdentity>,
    verifier: Arc<DropVerifier>,
    root: PathBuf,
    bind_addr: SocketAddr,
    settings: QuicSettings,
}

impl UploadServer {
    /// Create a new upload server rooted at `root`.
    pub fn new(
        identity: Arc<DeviceIdentity>,
        verifier: Arc<DropVerifier>,
        root: PathBuf,
        bind_addr: SocketAddr,
        settings: QuicSettings,
    ) -> Self {
        Self {
            endpoint: None,
            identity,
            verifier,
            root,
            bind_addr,
            settings,
        }
    }

    /// Bind the endpoint and start listening.
    pub async fn start(&mut self) -> Result<()> {
        if self.endpoint.is_some() {
            return Err(TransportError::Config(
                "Server already running".to_string(),
            ));
        }

        fs::create_dir_all(&self.root).await?;

        let server_config = self
            .settings
            .build_server_config(&self.identity, self.verifier.clone())?;
        let endpoint = Endpoint::server(server_config, self.bind_addr)
            .map_err(|e| TransportError::Config(format!("Failed to bind endpoint: {}", e)))?;

        info!("Harbor listening on {}", self.bind_addr);
        info!("Device ID: {}", self.identity.device_id());

        self.endpoint = Some(endpoint);
        Ok(())
    }

    /// Stop the server.
    pub fn stop(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close(0u32.into(), b"server shutdown");
            info!("Harbor stopped");
        }
    }

    /// Get the bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.as_ref().and_then(|e| e.local_addr().ok())
    }

    /// Run the accept loop until the endpoint closes.
    pub async fn run(&self) -> Result<()> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| TransportError::Config("Server not started".to_string()))?;

        while let Some(connecting) = endpoint.accept().await {
            let remote_addr = connecting.remote_address();
            let root = self.root.clone();

            tokio::spawn(async move {
                match connecting.await {
                    Ok(connection) => {
                        debug!("Accepted upload connection from {}", remote_addr);
                        handle_connection(connection, root).await;
                    }
                    Err(e) => {
                        warn!("Handshake failed with {}: {}", remote_addr, e);
                    }
                }
            });
        }

        Ok(())
    }
}

impl Drop for UploadServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Handle upload streams on an established connection.
async fn handle_connection(connection: quinn::Connection, root: PathBuf) {
    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                let root = root.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_upload(send, recv, root).await {
                        error!("Upload handling error: {}", e);
                    }
                });
            }
            Err(e) => {
                debug!("Connection closed: {}", e);
                break;
            }
        }
    }
}

/// Resolve a harbor-relative destination path, refusing traversal.
fn resolve_dest(root: &Path, dest: &str) -> Option<PathBuf> {
    if dest.is_empty() {
        return None;
    }
    let dest = Path::new(dest);
    if dest.is_absolute() {
        return None;
    }
    for component in dest.components() {
        match component {
            Component::Normal(_) => {}
            _ => return None,
        }
    }
    Some(root.join(dest))
}

async fn handle_upload(
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    root: PathBuf,
) -> Result<()> {
    let (dest_path, size, digest_hex) = match WireMessage::receive(&mut recv).await? {
        WireMessage::UploadRequest {
            dest_path,
            size,
            digest,
        } => (dest_path, size, digest),
        other => {
            let response = WireMessage::UploadResponse {
                accepted: false,
                reason: Some("Expected upload request".to_string()),
            };
            response.send(&mut send).await?;
            return Err(TransportError::Network(format!(
                "Unexpected opening message: {:?}",
                other
            )));
        }
    };

    let expected_digest = match Fingerprint::from_hex(&digest_hex) {
        Ok(d) => d,
        Err(_) => {
            let response = WireMessage::UploadResponse {
                accepted: false,
                reason: Some("Malformed digest".to_string()),
            };
            response.send(&mut send).await?;
            return Ok(());
        }
    };

    let final_path = match resolve_dest(&root, &dest_path) {
        Some(p) => p,
        None => {
            warn!("Rejecting upload with invalid destination: {}", dest_path);
            let response = WireMessage::UploadResponse {
                accepted: false,
                reason: Some(format!("Invalid destination path: {}", dest_path)),
            };
            response.send(&mut send).await?;
            return Ok(());
        }
    };

    if let Some(parent) = final_path.parent() {
        if let Err(e) = fs::create_dir_all(parent).await {
            let response = WireMessage::UploadResponse {
                accepted: false,
                reason: Some(format!("Cannot create destination directory: {}", e)),
            };
            response.send(&mut send).await?;
            return Ok(());
        }
    }

    debug!(
        "Accepting upload of {} bytes to {}",
        size,
        final_path.display()
    );
    let response = WireMessage::UploadResponse {
        accepted: true,
        reason: None,
    };
    response.send(&mut send).await?;

    // Write to a temp sibling while re-hashing, then rename into place
    let temp_path = final_path.with_extension(format!(
        "{}.partial.{}",
        final_path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or(""),
        uuid::Uuid::new_v4().simple()
    ));

    let outcome = receive_payload(&mut recv, &temp_path, size, &expected_digest).await;

    let completion = match outcome {
        Ok(()) => match commit(&temp_path, &final_path).await {
            Ok(()) => {
                info!("Stored upload at {}", final_path.display());
                WireMessage::UploadComplete {
                    stored: true,
                    digest_ok: true,
                    message: "Stored".to_string(),
                }
            }
            Err(e) => {
                cleanup_temp(&temp_path).await;
                WireMessage::UploadComplete {
                    stored: false,
                    digest_ok: true,
                    message: format!("Failed to store file: {}", e),
                }
            }
        },
        Err(UploadFailure::DigestMismatch { actual }) => {
            cleanup_temp(&temp_path).await;
            warn!(
                "Digest mismatch for {}: expected {}, got {}",
                final_path.display(),
                expected_digest,
                actual
            );
            WireMessage::UploadComplete {
                stored: false,
                digest_ok: false,
                message: "Digest verification failed".to_string(),
            }
        }
        Err(UploadFailure::Write(e)) => {
            cleanup_temp(&temp_path).await;
            WireMessage::UploadComplete {
                stored: false,
                digest_ok: false,
                message: format!("Write failed: {}", e),
            }
        }
        Err(UploadFailure::Transport(e)) => {
            // Stream died mid-payload; nobody is listening for a completion
            cleanup_temp(&temp_path).await;
            return Err(e);
        }
    };

    completion.send(&mut send).await?;
    send.finish()
        .map_err(|e| TransportError::Network(format!("Failed to finish stream: {}", e)))?;
    Ok(())
}

enum UploadFailure {
    DigestMismatch { actual: Fingerprint },
    Write(std::io::Error),
    Transport(TransportError),
}

async fn receive_payload(
    recv: &mut quinn::RecvStream,
    temp_path: &Path,
    size: u64,
    expected_digest: &Fingerprint,
) -> std::result::Result<(), UploadFailure> {
    let mut file = fs::File::create(temp_path)
        .await
        .map_err(UploadFailure::Write)?;
    let mut hasher = Sha256::new();
    let mut remaining = size;
    let mut buf = vec![0u8; TRANSFER_CHUNK_SIZE];

    while remaining > 0 {
        let chunk = remaining.min(TRANSFER_CHUNK_SIZE as u64) as usize;
        recv.read_exact(&mut buf[..chunk])
            .await
            .map_err(|e| UploadFailure::Transport(e.into()))?;
        hasher.update(&buf[..chunk]);
        file.write_all(&buf[..chunk])
            .await
            .map_err(UploadFailure::Write)?;
        remaining -= chunk as u64;
    }

    file.flush().await.map_err(UploadFailure::Write)?;
    file.sync_all().await.map_err(UploadFailure::Write)?;

    let actual = Fingerprint::from_bytes(hasher.finalize().into());
    if actual != *expected_digest {
        return Err(UploadFailure::DigestMismatch { actual });
    }
    Ok(())
}

async fn commit(temp_path: &Path, final_path: &Path) -> std::io::Result<()> {
    fs::rename(temp_path, final_path).await
}

async fn cleanup_temp(temp_path: &Path) {
    if let Err(e) = fs::remove_file(temp_path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(
                "Failed to clean up temp file {}: {}",
                temp_path.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_dest_accepts_relative_paths() {
        let root = PathBuf::from("/srv/uploads");
        assert_eq!(
            resolve_dest(&root, "report.csv"),
            Some(PathBuf::from("/srv/uploads/report.csv"))
        );
        assert_eq!(
            resolve_dest(&root, "daily/report.csv"),
            Some(PathBuf::from("/srv/uploads/daily/report.csv"))
        );
    }

    #[test]
    fn test_resolve_dest_rejects_traversal() {
        let root = PathBuf::from("/srv/uploads");
        assert!(resolve_dest(&root, "../etc/passwd").is_none());
        assert!(resolve_dest(&root, "a/../../b").is_none());
        assert!(resolve_dest(&root, "/etc/passwd").is_none());
        assert!(resolve_dest(&root, "").is_none());
        assert!(resolve_dest(&root, "./x").is_none());
    }
}
