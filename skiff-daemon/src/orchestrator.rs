//! Transfer orchestration.
//!
//! Settled files arrive from the stabilizer; each becomes one task that
//! fingerprints the file, pushes it through the transport with bounded
//! retries, and hands exactly one [`TransferOutcome`] to the audit recorder.
//! Concurrency is capped by a semaphore; an in-flight set keeps a second
//! promotion of the same path from spawning a second task.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use skiff_fingerprint::{fingerprint_file, Fingerprint};
use skiff_quic::{TransportClient, TransportError};
use skiff_watch::StableFile;

use crate::audit::{AuditRecorder, ErrorKind, TransferOutcome};

/// Seam between orchestration and the QUIC client, so retry policy can be
/// exercised against scripted failures.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        local_path: &Path,
        dest_path: &str,
        digest: &Fingerprint,
    ) -> skiff_quic::Result<()>;
}

#[async_trait]
impl Transport for TransportClient {
    async fn send(
        &self,
        local_path: &Path,
        dest_path: &str,
        digest: &Fingerprint,
    ) -> skiff_quic::Result<()> {
        TransportClient::send(self, local_path, dest_path, digest).await
    }
}

/// Retry and concurrency policy.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Total attempts per file, first try included.
    pub max_attempts: u32,

    /// Backoff before the first retry; doubles per retry.
    pub backoff_base: Duration,

    /// Cap on transfers running at once.
    pub max_concurrent_transfers: usize,

    /// How long in-flight transfers get to finish on shutdown.
    pub shutdown_grace: Duration,

    /// Harbor-relative directory uploads land in; empty means the root.
    pub destination_path: String,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            max_concurrent_transfers: 8,
            shutdown_grace: Duration::from_secs(5),
            destination_path: String::new(),
        }
    }
}

fn kind_for(error: &TransportError) -> ErrorKind {
    match error {
        TransportError::Auth(_) => ErrorKind::Auth,
        TransportError::Network(_) => ErrorKind::Network,
        TransportError::RemoteWrite(_) => ErrorKind::RemoteWrite,
        // Misconfiguration surfaces as a local failure, never retried
        TransportError::Config(_) => ErrorKind::Io,
    }
}

/// Harbor-relative destination for a source file.
fn dest_for(destination_path: &str, path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_string());
    let base = destination_path.trim_matches('/');
    if base.is_empty() {
        name
    } else {
        format!("{}/{}", base, name)
    }
}

pub struct TransferOrchestrator {
    settings: OrchestratorSettings,
    transport: Arc<dyn Transport>,
    audit: Arc<dyn AuditRecorder>,
    files: mpsc::Receiver<StableFile>,
    shutdown: watch::Receiver<bool>,
}

impl TransferOrchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        transport: Arc<dyn Transport>,
        audit: Arc<dyn AuditRecorder>,
        files: mpsc::Receiver<StableFile>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            settings,
            transport,
            audit,
            files,
            shutdown,
        }
    }

    /// Run until the intake channel closes or shutdown is signalled, then
    /// drain in-flight transfers within the grace period.
    pub async fn run(mut self) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_transfers));
        let in_flight: Arc<Mutex<HashSet<PathBuf>>> = Arc::new(Mutex::new(HashSet::new()));
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                maybe = self.files.recv() => match maybe {
                    Some(file) => {
                        self.dispatch(file, &mut tasks, &semaphore, &in_flight, cancel_rx.clone());
                    }
                    None => {
                        debug!("Intake closed, draining transfers");
                        break;
                    }
                },
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!("Shutdown requested, draining transfers");
                        break;
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!("Transfer task panicked: {}", e);
                    }
                }
            }
        }

        let drained = timeout(self.settings.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!("Shutdown grace expired, interrupting remaining transfers");
            let _ = cancel_tx.send(true);
            while tasks.join_next().await.is_some() {}
        }

        info!("Orchestrator stopped");
    }

    fn dispatch(
        &self,
        file: StableFile,
        tasks: &mut JoinSet<()>,
        semaphore: &Arc<Semaphore>,
        in_flight: &Arc<Mutex<HashSet<PathBuf>>>,
        cancel: watch::Receiver<bool>,
    ) {
        {
            let mut guard = in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !guard.insert(file.path.clone()) {
                debug!("Transfer already in flight: {}", file.path.display());
                return;
            }
        }

        let settings = self.settings.clone();
        let transport = self.transport.clone();
        let audit = self.audit.clone();
        let semaphore = semaphore.clone();
        let in_flight = in_flight.clone();

        tasks.spawn(async move {
            let path = file.path.clone();
            let outcome = run_transfer(&settings, transport.as_ref(), semaphore, &file, cancel).await;
            audit.record(outcome).await;
            in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&path);
        });
    }
}

async fn run_transfer(
    settings: &OrchestratorSettings,
    transport: &dyn Transport,
    semaphore: Arc<Semaphore>,
    file: &StableFile,
    mut cancel: watch::Receiver<bool>,
) -> TransferOutcome {
    let dest = dest_for(&settings.destination_path, &file.path);

    let _permit = tokio::select! {
        permit = semaphore.acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => {
                return TransferOutcome::failure(
                    file.path.clone(), None, dest, 0,
                    ErrorKind::Interrupted, "Orchestrator shut down",
                );
            }
        },
        _ = wait_cancelled(&mut cancel) => {
            return TransferOutcome::failure(
                file.path.clone(), None, dest, 0,
                ErrorKind::Interrupted, "Shutdown before transfer started",
            );
        }
    };

    let digest = match fingerprint_file(&file.path).await {
        Ok(d) => d,
        Err(e) => {
            // A source that cannot be read does not self-heal; no retry
            warn!("Cannot fingerprint {}: {}", file.path.display(), e);
            return TransferOutcome::failure(
                file.path.clone(),
                None,
                dest,
                0,
                ErrorKind::Io,
                e.to_string(),
            );
        }
    };
    debug!("Fingerprinted {}: {}", file.path.display(), digest);

    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let result = tokio::select! {
            result = transport.send(&file.path, &dest, &digest) => result,
            _ = wait_cancelled(&mut cancel) => {
                return TransferOutcome::failure(
                    file.path.clone(), Some(digest), dest, attempt,
                    ErrorKind::Interrupted, "Shutdown during transfer",
                );
            }
        };

        match result {
            Ok(()) => {
                info!(
                    "Transferred {} -> {} (attempt {})",
                    file.path.display(),
                    dest,
                    attempt
                );
                return TransferOutcome::success(file.path.clone(), digest, dest, attempt);
            }
            Err(e) if e.is_retryable() && attempt < settings.max_attempts => {
                let exponent = (attempt - 1).min(16);
                let delay = settings.backoff_base.saturating_mul(1u32 << exponent);
                warn!(
                    "Attempt {}/{} failed for {}: {}; retrying in {:?}",
                    attempt,
                    settings.max_attempts,
                    file.path.display(),
                    e,
                    delay
                );
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = wait_cancelled(&mut cancel) => {
                        return TransferOutcome::failure(
                            file.path.clone(), Some(digest), dest, attempt,
                            ErrorKind::Interrupted, "Shutdown during retry backoff",
                        );
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Transfer failed for {} after {} attempt(s): {}",
                    file.path.display(),
                    attempt,
                    e
                );
                return TransferOutcome::failure(
                    file.path.clone(),
                    Some(digest),
                    dest,
                    attempt,
                    kind_for(&e),
                    e.to_string(),
                );
            }
        }
    }
}

/// Resolves once cancellation is signalled; pends forever otherwise.
async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditRecorder;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct ScriptedTransport {
        calls: AtomicU32,
        /// Number of leading calls that fail with a network error.
        network_failures: u32,
        /// When set, every call fails with this error instead.
        terminal: Option<fn() -> TransportError>,
        delay: Duration,
    }

    impl ScriptedTransport {
        fn succeeding() -> Self {
            Self {
                calls: AtomicU32::new(0),
                network_failures: 0,
                terminal: None,
                delay: Duration::ZERO,
            }
        }

        fn failing_network_times(n: u32) -> Self {
            Self {
                network_failures: n,
                ..Self::succeeding()
            }
        }

        fn always(error: fn() -> TransportError) -> Self {
            Self {
                terminal: Some(error),
                ..Self::succeeding()
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            _local_path: &Path,
            _dest_path: &str,
            _digest: &Fingerprint,
        ) -> skiff_quic::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                sleep(self.delay).await;
            }
            if let Some(make_error) = self.terminal {
                return Err(make_error());
            }
            if call < self.network_failures {
                return Err(TransportError::Network("connection reset".into()));
            }
            Ok(())
        }
    }

    fn fast_settings() -> OrchestratorSettings {
        OrchestratorSettings {
            max_attempts: 3,
            backoff_base: Duration::from_millis(1),
            max_concurrent_transfers: 8,
            shutdown_grace: Duration::from_secs(1),
            destination_path: "uploads".to_string(),
        }
    }

    fn stable(path: PathBuf) -> StableFile {
        StableFile {
            path,
            discovered_at: Utc::now(),
        }
    }

    async fn run_with_files(
        settings: OrchestratorSettings,
        transport: Arc<ScriptedTransport>,
        paths: Vec<PathBuf>,
    ) -> Vec<TransferOutcome> {
        let audit = Arc::new(MemoryAuditRecorder::new());
        let (file_tx, file_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let orchestrator = TransferOrchestrator::new(
            settings,
            transport,
            audit.clone(),
            file_rx,
            shutdown_rx,
        );
        let handle = tokio::spawn(orchestrator.run());

        for path in paths {
            file_tx.send(stable(path)).await.unwrap();
        }
        drop(file_tx);
        handle.await.unwrap();

        audit.outcomes()
    }

    #[tokio::test]
    async fn test_clean_transfer_single_attempt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.csv");
        std::fs::write(&path, b"a,b,c").unwrap();

        let transport = Arc::new(ScriptedTransport::succeeding());
        let outcomes = run_with_files(fast_settings(), transport.clone(), vec![path.clone()]).await;

        assert_eq!(outcomes.len(), 1);
        let outcome = &outcomes[0];
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.dest, "uploads/report.csv");
        assert_eq!(
            outcome.digest.unwrap().to_hex(),
            "205830ca5b23bbe39ab510cfddc1dff2d9842e38b5fa7b7c48cd4ca7e44f92a1"
        );
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_network_failure_retries_then_succeeds() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"payload").unwrap();

        let transport = Arc::new(ScriptedTransport::failing_network_times(2));
        let outcomes = run_with_files(fast_settings(), transport.clone(), vec![path]).await;

        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].is_success());
        assert_eq!(outcomes[0].attempts, 3);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_persistent_network_failure_exhausts_attempts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"payload").unwrap();

        let transport = Arc::new(ScriptedTransport::always(|| {
            TransportError::Network("unreachable".into())
        }));
        let outcomes = run_with_files(fast_settings(), transport.clone(), vec![path]).await;

        assert_eq!(outcomes.len(), 1);
        let outcome = &outcomes[0];
        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(transport.calls(), 3);
        let (kind, _) = outcome.error.as_ref().unwrap();
        assert_eq!(*kind, ErrorKind::Network);
    }

    #[tokio::test]
    async fn test_auth_failure_is_never_retried() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"payload").unwrap();

        let transport = Arc::new(ScriptedTransport::always(|| {
            TransportError::Auth("certificate rejected".into())
        }));
        let outcomes = run_with_files(fast_settings(), transport.clone(), vec![path]).await;

        assert_eq!(outcomes.len(), 1);
        let outcome = &outcomes[0];
        assert!(!outcome.is_success());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(transport.calls(), 1);
        let (kind, _) = outcome.error.as_ref().unwrap();
        assert_eq!(*kind, ErrorKind::Auth);
    }

    #[tokio::test]
    async fn test_remote_write_failure_is_never_retried() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"payload").unwrap();

        let transport = Arc::new(ScriptedTransport::always(|| {
            TransportError::RemoteWrite("disk full".into())
        }));
        let outcomes = run_with_files(fast_settings(), transport.clone(), vec![path]).await;

        assert_eq!(outcomes[0].attempts, 1);
        assert_eq!(transport.calls(), 1);
        let (kind, _) = outcomes[0].error.as_ref().unwrap();
        assert_eq!(*kind, ErrorKind::RemoteWrite);
    }

    #[tokio::test]
    async fn test_unreadable_source_fails_without_transfer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("vanished.txt");
        // never created

        let transport = Arc::new(ScriptedTransport::succeeding());
        let outcomes = run_with_files(fast_settings(), transport.clone(), vec![path]).await;

        assert_eq!(outcomes.len(), 1);
        let outcome = &outcomes[0];
        assert!(!outcome.is_success());
        assert!(outcome.digest.is_none());
        assert_eq!(outcome.attempts, 0);
        assert_eq!(transport.calls(), 0);
        let (kind, _) = outcome.error.as_ref().unwrap();
        assert_eq!(*kind, ErrorKind::Io);
    }

    #[tokio::test]
    async fn test_duplicate_promotion_yields_one_outcome() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dup.txt");
        std::fs::write(&path, b"once").unwrap();

        let transport = Arc::new(ScriptedTransport {
            delay: Duration::from_millis(100),
            ..ScriptedTransport::succeeding()
        });
        let outcomes = run_with_files(
            fast_settings(),
            transport.clone(),
            vec![path.clone(), path.clone()],
        )
        .await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_two_files_each_get_an_outcome() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        std::fs::write(&a, b"first").unwrap();
        std::fs::write(&b, b"second").unwrap();

        let transport = Arc::new(ScriptedTransport::succeeding());
        let outcomes = run_with_files(fast_settings(), transport.clone(), vec![a.clone(), b.clone()]).await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.is_success()));
        let paths: HashSet<PathBuf> = outcomes.iter().map(|o| o.path.clone()).collect();
        assert!(paths.contains(&a));
        assert!(paths.contains(&b));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_stuck_transfer() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("slow.bin");
        std::fs::write(&path, b"slow payload").unwrap();

        let transport = Arc::new(ScriptedTransport {
            delay: Duration::from_secs(60),
            ..ScriptedTransport::succeeding()
        });
        let audit = Arc::new(MemoryAuditRecorder::new());
        let (file_tx, file_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let settings = OrchestratorSettings {
            shutdown_grace: Duration::from_millis(50),
            ..fast_settings()
        };
        let orchestrator =
            TransferOrchestrator::new(settings, transport, audit.clone(), file_rx, shutdown_rx);
        let handle = tokio::spawn(orchestrator.run());

        file_tx.send(stable(path)).await.unwrap();
        sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let outcomes = audit.outcomes();
        assert_eq!(outcomes.len(), 1);
        let (kind, _) = outcomes[0].error.as_ref().unwrap();
        assert_eq!(*kind, ErrorKind::Interrupted);
    }

    #[test]
    fn test_dest_for_joins_destination() {
        assert_eq!(dest_for("", Path::new("/drop/a.txt")), "a.txt");
        assert_eq!(dest_for("uploads", Path::new("/drop/a.txt")), "uploads/a.txt");
        assert_eq!(
            dest_for("uploads/daily/", Path::new("/drop/a.txt")),
            "uploads/daily/a.txt"
        );
    }
}
