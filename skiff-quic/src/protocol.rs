//! Wire protocol for a single file upload.
//!
//! One upload rides one bidirectional stream:
//! 1. `UploadRequest` - destination path, size and declared digest
//! 2. `UploadResponse` - harbor accepts or rejects the request
//! 3. raw file bytes (exactly `size` of them, no framing)
//! 4. `UploadComplete` - harbor reports whether the file was stored and the
//!    digest verified
//!
//! Control messages are length-prefixed JSON; the payload is streamed raw so
//! large files never sit in a message buffer.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use crate::errors::{Result, TransportError};

/// Upper bound for a control message; anything bigger is a protocol violation.
const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Chunk size used when streaming file bytes.
pub(crate) const TRANSFER_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Request to upload a file to a harbor-relative destination path.
    UploadRequest {
        dest_path: String,
        size: u64,
        digest: String,
    },
    /// Harbor's verdict on the request.
    UploadResponse {
        accepted: bool,
        reason: Option<String>,
    },
    /// Harbor's report after receiving the payload.
    UploadComplete {
        stored: bool,
        digest_ok: bool,
        message: String,
    },
}

impl WireMessage {
    /// Send a control message over a stream.
    pub async fn send<W: AsyncWriteExt + Unpin>(&self, writer: &mut W) -> Result<()> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| TransportError::Network(format!("Failed to encode message: {}", e)))?;
        let len = bytes.len() as u32;

        writer.write_all(&len.to_be_bytes()).await?;
        writer.write_all(&bytes).await?;

        trace!("Sent wire message: {:?}", self);
        Ok(())
    }

    /// Receive a control message from a stream.
    pub async fn receive<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Self> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_MESSAGE_SIZE {
            return Err(TransportError::Network(format!(
                "Control message too large: {} bytes",
                len
            )));
        }

        let mut msg_buf = vec![0u8; len];
        reader.read_exact(&mut msg_buf).await?;

        let message = serde_json::from_slice(&msg_buf)
            .map_err(|e| TransportError::Network(format!("Failed to decode message: {}", e)))?;
        trace!("Received wire message: {:?}", message);
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_message_send_receive() {
        let msg = WireMessage::UploadRequest {
            dest_path: "uploads/report.csv".to_string(),
            size: 5,
            digest: "abcd1234".to_string(),
        };

        let mut buffer = Vec::new();
        msg.send(&mut buffer).await.unwrap();

        let mut cursor = Cursor::new(buffer);
        let received = WireMessage::receive(&mut cursor).await.unwrap();

        match received {
            WireMessage::UploadRequest {
                dest_path,
                size,
                digest,
            } => {
                assert_eq!(dest_path, "uploads/report.csv");
                assert_eq!(size, 5);
                assert_eq!(digest, "abcd1234");
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[tokio::test]
    async fn test_oversized_message_rejected() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes());
        buffer.extend_from_slice(&[0u8; 16]);

        let mut cursor = Cursor::new(buffer);
        let result = WireMessage::receive(&mut cursor).await;
        assert!(matches!(result, Err(TransportError::Network(_))));
    }

    #[tokio::test]
    async fn test_truncated_message_is_error() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&100u32.to_be_bytes());
        buffer.extend_from_slice(b"short");

        let mut cursor = Cursor::new(buffer);
        assert!(WireMessage::receive(&mut cursor).await.is_err());
    }
}
