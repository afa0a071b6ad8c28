//! Durable per-file transfer records.
//!
//! Every transfer task ends in exactly one [`TransferOutcome`], appended as a
//! single line to the audit log. The log is the system's sole durable output,
//! so the line format is stable and greppable:
//!
//! ```text
//! <ISO-8601> path=<source> digest=<hex|-> dest=<dest> result=<Success|Failed> attempts=<n>[ error=<Kind>: <msg>]
//! ```

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info};

use skiff_fingerprint::Fingerprint;

use crate::errors::{DaemonError, Result};

/// Failure classification carried in audit records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Auth,
    Network,
    RemoteWrite,
    Interrupted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Io => "IOError",
            ErrorKind::Auth => "AuthError",
            ErrorKind::Network => "NetworkError",
            ErrorKind::RemoteWrite => "RemoteWriteError",
            ErrorKind::Interrupted => "Interrupted",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final record for one transfer task.
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub timestamp: DateTime<Utc>,
    pub path: PathBuf,
    /// Absent when fingerprinting failed before any transfer attempt.
    pub digest: Option<Fingerprint>,
    pub dest: String,
    pub attempts: u32,
    pub error: Option<(ErrorKind, String)>,
}

impl TransferOutcome {
    pub fn success(path: PathBuf, digest: Fingerprint, dest: String, attempts: u32) -> Self {
        Self {
            timestamp: Utc::now(),
            path,
            digest: Some(digest),
            dest,
            attempts,
            error: None,
        }
    }

    pub fn failure(
        path: PathBuf,
        digest: Option<Fingerprint>,
        dest: String,
        attempts: u32,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            path,
            digest,
            dest,
            attempts,
            error: Some((kind, message.into())),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Render the audit line (no trailing newline).
    pub fn format_line(&self) -> String {
        let digest = self
            .digest
            .as_ref()
            .map(|d| d.to_hex())
            .unwrap_or_else(|| "-".to_string());
        let result = if self.is_success() { "Success" } else { "Failed" };

        let mut line = format!(
            "{} path={} digest={} dest={} result={} attempts={}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.path.display(),
            digest,
            self.dest,
            result,
            self.attempts,
        );
        if let Some((kind, message)) = &self.error {
            line.push_str(&format!(" error={}: {}", kind, message));
        }
        line
    }
}

/// Sink for transfer outcomes.
#[async_trait]
pub trait AuditRecorder: Send + Sync {
    async fn record(&self, outcome: TransferOutcome);
}

enum AuditCommand {
    Record(TransferOutcome),
    Flush(oneshot::Sender<()>),
}

/// Appends audit lines to a file through a dedicated writer task, so
/// concurrent transfer tasks never interleave partial lines.
pub struct FileAuditRecorder {
    tx: mpsc::Sender<AuditCommand>,
}

impl FileAuditRecorder {
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, mut rx) = mpsc::channel::<AuditCommand>(256);
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    AuditCommand::Record(outcome) => {
                        let line = outcome.format_line();
                        if let Err(e) = file.write_all(line.as_bytes()).await {
                            error!("Failed to write audit line: {}", e);
                            continue;
                        }
                        if let Err(e) = file.write_all(b"\n").await {
                            error!("Failed to write audit line: {}", e);
                            continue;
                        }
                        if let Err(e) = file.flush().await {
                            error!("Failed to flush audit log: {}", e);
                        }
                    }
                    AuditCommand::Flush(ack) => {
                        if let Err(e) = file.flush().await {
                            error!("Failed to flush audit log: {}", e);
                        }
                        let _ = ack.send(());
                    }
                }
            }
            info!("Audit writer stopped");
        });

        Ok(Self { tx })
    }

    /// Wait until every queued record has hit the file.
    pub async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(AuditCommand::Flush(ack_tx))
            .await
            .map_err(|_| DaemonError::Audit("Audit writer gone".into()))?;
        ack_rx
            .await
            .map_err(|_| DaemonError::Audit("Audit writer gone".into()))?;
        Ok(())
    }
}

#[async_trait]
impl AuditRecorder for FileAuditRecorder {
    async fn record(&self, outcome: TransferOutcome) {
        if self.tx.send(AuditCommand::Record(outcome)).await.is_err() {
            error!("Audit writer gone, record lost");
        }
    }
}

/// In-memory recorder backing tests.
#[derive(Default)]
pub struct MemoryAuditRecorder {
    outcomes: Mutex<Vec<TransferOutcome>>,
}

impl MemoryAuditRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcomes(&self) -> Vec<TransferOutcome> {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl AuditRecorder for MemoryAuditRecorder {
    async fn record(&self, outcome: TransferOutcome) {
        self.outcomes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_digest() -> Fingerprint {
        skiff_fingerprint::fingerprint_bytes(b"a,b,c")
    }

    #[test]
    fn test_success_line_format() {
        let outcome = TransferOutcome::success(
            PathBuf::from("/drop/report.csv"),
            sample_digest(),
            "uploads/report.csv".to_string(),
            1,
        );
        let line = outcome.format_line();

        assert!(line.contains(" path=/drop/report.csv "));
        assert!(line.contains(&format!(" digest={} ", sample_digest().to_hex())));
        assert!(line.contains(" dest=uploads/report.csv "));
        assert!(line.contains(" result=Success "));
        assert!(line.ends_with("attempts=1"));
        assert!(!line.contains("error="));
    }

    #[test]
    fn test_failure_line_format() {
        let outcome = TransferOutcome::failure(
            PathBuf::from("/drop/report.csv"),
            None,
            "uploads/report.csv".to_string(),
            3,
            ErrorKind::Network,
            "connection reset",
        );
        let line = outcome.format_line();

        assert!(line.contains(" digest=- "));
        assert!(line.contains(" result=Failed "));
        assert!(line.contains(" attempts=3 "));
        assert!(line.ends_with("error=NetworkError: connection reset"));
    }

    #[test]
    fn test_error_kind_names() {
        assert_eq!(ErrorKind::Io.as_str(), "IOError");
        assert_eq!(ErrorKind::Auth.as_str(), "AuthError");
        assert_eq!(ErrorKind::Network.as_str(), "NetworkError");
        assert_eq!(ErrorKind::RemoteWrite.as_str(), "RemoteWriteError");
        assert_eq!(ErrorKind::Interrupted.as_str(), "Interrupted");
    }

    #[tokio::test]
    async fn test_file_recorder_appends_lines() {
        let dir = TempDir::new().unwrap();
        let log_path = dir.path().join("audit.log");

        let recorder = FileAuditRecorder::create(&log_path).await.unwrap();
        recorder
            .record(TransferOutcome::success(
                PathBuf::from("/drop/a.txt"),
                sample_digest(),
                "a.txt".to_string(),
                1,
            ))
            .await;
        recorder
            .record(TransferOutcome::failure(
                PathBuf::from("/drop/b.txt"),
                Some(sample_digest()),
                "b.txt".to_string(),
                3,
                ErrorKind::Network,
                "timed out",
            ))
            .await;
        recorder.flush().await.unwrap();

        let contents = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("result=Success"));
        assert!(lines[1].contains("result=Failed"));
    }
}
