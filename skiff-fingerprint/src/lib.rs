//! Content fingerprinting for skiff transfers.
//!
//! Every file that leaves the watched directory is summarized by a SHA-256
//! digest before it is sent, so the audit trail can tie an upload to exact
//! byte content. The caller is responsible for only fingerprinting files
//! that have stabilized; a file that vanishes or becomes unreadable between
//! stabilization and the read surfaces as an I/O error here.

use std::fmt;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::trace;

mod errors;

pub use errors::{FingerprintError, Result};

/// Read buffer size for streaming file contents through the hasher.
const READ_BUF_SIZE: usize = 64 * 1024;

/// A 256-bit content digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Create from raw digest bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get as bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(FingerprintError::InvalidDigest(format!(
                "expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut array = [0u8; 32];
        array.copy_from_slice(&bytes);
        Ok(Self(array))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Fingerprint a byte slice in memory.
pub fn fingerprint_bytes(data: &[u8]) -> Fingerprint {
    let digest = Sha256::digest(data);
    Fingerprint(digest.into())
}

/// Compute the fingerprint of a file's full contents.
///
/// The file is streamed through the hasher in fixed-size reads rather than
/// loaded whole, so large drops do not balloon memory. Fails with
/// `FingerprintError::Io` if the file disappears or becomes unreadable.
pub async fn fingerprint_file(path: impl AsRef<Path>) -> Result<Fingerprint> {
    let path = path.as_ref();
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    let fingerprint = Fingerprint(hasher.finalize().into());
    trace!(
        "Fingerprinted {} ({} bytes): {}",
        path.display(),
        total,
        fingerprint
    );
    Ok(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fingerprint_bytes_deterministic() {
        let a = fingerprint_bytes(b"a,b,c");
        let b = fingerprint_bytes(b"a,b,c");
        assert_eq!(a, b);

        // Known SHA-256 of "a,b,c"
        assert_eq!(
            a.to_hex(),
            "205830ca5b23bbe39ab510cfddc1dff2d9842e38b5fa7b7c48cd4ca7e44f92a1"
        );
    }

    #[test]
    fn test_single_byte_change_alters_digest() {
        let a = fingerprint_bytes(b"a,b,c");
        let b = fingerprint_bytes(b"a,b,d");
        assert_ne!(a, b);
    }

    #[test]
    fn test_hex_round_trip() {
        let fp = fingerprint_bytes(b"round trip");
        let parsed = Fingerprint::from_hex(&fp.to_hex()).unwrap();
        assert_eq!(fp, parsed);

        assert!(Fingerprint::from_hex("abcd").is_err());
        assert!(Fingerprint::from_hex("not hex at all").is_err());
    }

    #[tokio::test]
    async fn test_fingerprint_file_matches_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.csv");
        tokio::fs::write(&path, b"a,b,c").await.unwrap();

        let from_file = fingerprint_file(&path).await.unwrap();
        assert_eq!(from_file, fingerprint_bytes(b"a,b,c"));
    }

    #[tokio::test]
    async fn test_fingerprint_file_streams_large_input() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        let data = vec![0xabu8; READ_BUF_SIZE * 3 + 17];
        tokio::fs::write(&path, &data).await.unwrap();

        let from_file = fingerprint_file(&path).await.unwrap();
        assert_eq!(from_file, fingerprint_bytes(&data));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let result = fingerprint_file(dir.path().join("vanished.txt")).await;
        assert!(matches!(result, Err(FingerprintError::Io(_))));
    }
}
