use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};
use zeroize::Zeroize;

use crate::errors::{CryptoError, Result};

/// A unique device identifier derived from an Ed25519 public key.
///
/// Device IDs identify both the sending skiff and the remote harbor. The
/// harbor's device ID is what the host-key policy pins in the known-hosts
/// file, so "the host key changed" means exactly "this ID changed".
///
/// Device IDs are displayed as fingerprints - Blake3 hashes of the public key
/// formatted as colon-separated hex groups for easy verification.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub [u8; 32]);

impl DeviceId {
    /// Creates a DeviceId from raw bytes.
    ///
    /// Returns `CryptoError::InvalidKeyFormat` if the input is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyFormat(
                "Device ID must be 32 bytes".to_string(),
            ));
        }
        let mut id = [0u8; 32];
        id.copy_from_slice(bytes);
        Ok(DeviceId(id))
    }

    /// Returns the raw 32-byte public key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns the device ID as a hex string (for known-hosts entries, etc.)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Generates a human-readable fingerprint for manual verification.
    ///
    /// The fingerprint is a Blake3 hash of the public key with the first
    /// 16 bytes formatted as colon-separated hex groups, which is shorter
    /// and easier to compare by eye than the full key.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(&self.0);
        let bytes = hash.as_bytes();

        // Format as groups of 4 hex chars separated by colons
        bytes[..16]
            .chunks(2)
            .map(|chunk| format!("{:02x}{:02x}", chunk[0], chunk[1]))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.fingerprint())
    }
}

impl std::str::FromStr for DeviceId {
    type Err = CryptoError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.len() == 64 {
            let bytes = hex::decode(s)
                .map_err(|e| CryptoError::InvalidKeyFormat(format!("Invalid hex string: {}", e)))?;
            Self::from_bytes(&bytes)
        } else {
            Err(CryptoError::InvalidKeyFormat(format!(
                "Invalid DeviceId string length: {} (expected 64 hex characters)",
                s.len()
            )))
        }
    }
}

/// A device's long-term cryptographic identity using Ed25519 keys.
///
/// The identity is the credential material referenced by the daemon's
/// `identity_path` configuration option. It backs the self-signed TLS
/// certificate presented during the mutual handshake, so the remote harbor
/// authenticates this device by its ID and vice versa.
///
/// Private keys are stored with restricted file permissions (0600 on Unix)
/// and zeroized in memory when temporary copies are dropped.
#[derive(Debug)]
pub struct DeviceIdentity {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    device_name: String,
    storage_path: Option<PathBuf>,
}

impl DeviceIdentity {
    /// Generates a new identity with a cryptographically secure random Ed25519 keypair.
    pub fn generate(device_name: impl Into<String>) -> Result<Self> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        Ok(Self {
            signing_key,
            verifying_key,
            device_name: device_name.into(),
            storage_path: None,
        })
    }

    /// Get the device ID (public key)
    pub fn device_id(&self) -> DeviceId {
        DeviceId(self.verifying_key.to_bytes())
    }

    /// Get the device name
    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Get the default storage directory for keys
    pub fn default_storage_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or_else(|| {
            CryptoError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "Home directory not found",
            ))
        })?;
        Ok(home.join(".skiff").join("keys"))
    }

    /// Save identity to disk
    pub async fn save(&mut self, path: Option<&Path>) -> Result<()> {
        let storage_path = if let Some(p) = path {
            p.to_path_buf()
        } else {
            Self::default_storage_dir()?.join("device_identity.key")
        };

        // Ensure directory exists
        if let Some(parent) = storage_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Serialize identity (private key + metadata) with secure handling
        #[derive(Serialize, Zeroize)]
        #[zeroize(drop)]
        struct StoredIdentity {
            version: u8,
            device_name: String,
            private_key: [u8; 32],
        }

        let stored = StoredIdentity {
            version: 1,
            device_name: self.device_name.clone(),
            private_key: self.signing_key.to_bytes(),
        };

        let data =
            bincode::serialize(&stored).map_err(|e| CryptoError::Serialization(e.to_string()))?;
        drop(stored);

        // Write to a temporary file first, then atomically rename
        let temp_path = storage_path.with_extension("tmp");
        fs::write(&temp_path, &data).await?;

        // Set secure permissions before atomically moving
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = fs::metadata(&temp_path).await?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(0o600);
            fs::set_permissions(&temp_path, permissions).await?;
        }

        // Atomically move temp file to final location
        fs::rename(&temp_path, &storage_path).await?;

        self.storage_path = Some(storage_path);
        info!("Device identity saved");

        Ok(())
    }

    /// Load identity from disk
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let storage_path = if let Some(p) = path {
            p.to_path_buf()
        } else {
            Self::default_storage_dir()?.join("device_identity.key")
        };

        if !storage_path.exists() {
            return Err(CryptoError::KeyNotFound(storage_path.display().to_string()));
        }

        let data = fs::read(&storage_path).await?;

        #[derive(Deserialize)]
        struct StoredIdentity {
            version: u8,
            device_name: String,
            private_key: [u8; 32],
        }

        let mut stored: StoredIdentity =
            bincode::deserialize(&data).map_err(|e| CryptoError::Serialization(e.to_string()))?;

        if stored.version != 1 {
            return Err(CryptoError::InvalidKeyFormat(format!(
                "Unsupported key version: {}",
                stored.version
            )));
        }

        let signing_key = SigningKey::from_bytes(&stored.private_key);
        let verifying_key = signing_key.verifying_key();

        // Clear the temporary private key from memory
        stored.private_key.zeroize();

        debug!("Device identity loaded from {:?}", storage_path);

        Ok(Self {
            signing_key,
            verifying_key,
            device_name: stored.device_name,
            storage_path: Some(storage_path),
        })
    }

    /// Loads an existing identity from `path`, or generates and saves a new
    /// one if none exists there.
    ///
    /// This is how the daemon resolves its `identity_path` option on startup:
    /// first run creates the credential, later runs reuse it so the device ID
    /// stays stable across restarts.
    pub async fn load_or_generate(device_name: impl Into<String>, path: Option<&Path>) -> Result<Self> {
        match Self::load(path).await {
            Ok(identity) => {
                info!("Loaded existing device identity: {}", identity.device_id());
                Ok(identity)
            }
            Err(CryptoError::KeyNotFound(_)) => {
                info!("No existing identity found, generating new one");
                let mut identity = Self::generate(device_name)?;
                identity.save(path).await?;
                info!("Generated new device identity: {}", identity.device_id());
                Ok(identity)
            }
            Err(e) => Err(e),
        }
    }
}
