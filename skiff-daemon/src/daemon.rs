//! Wiring: watcher -> stabilizer -> orchestrator -> audit log.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use skiff_crypto::{DeviceIdentity, KnownHosts};
use skiff_quic::{QuicSettings, TransportClient};
use skiff_watch::{DropWatcher, Stabilizer};

use crate::audit::{AuditRecorder, FileAuditRecorder};
use crate::config::SkiffConfig;
use crate::errors::Result;
use crate::orchestrator::{OrchestratorSettings, TransferOrchestrator, Transport};

const RAW_EVENT_QUEUE: usize = 1024;
const STABLE_FILE_QUEUE: usize = 256;

pub struct Daemon;

impl Daemon {
    /// Start watching and transferring. Returns a handle for shutdown.
    pub async fn start(config: SkiffConfig) -> Result<DaemonHandle> {
        config.validate()?;

        let identity = Arc::new(
            DeviceIdentity::load_or_generate("skiff", config.identity_path.as_deref()).await?,
        );
        info!("Device ID: {}", identity.device_id());

        let known_hosts = KnownHosts::load(&config.known_hosts_path)?;
        let transport = Arc::new(TransportClient::new(
            identity,
            config.remote_host.clone(),
            config.remote_port,
            config.host_key_policy,
            known_hosts,
            QuicSettings::default(),
        )?);

        let audit = Arc::new(FileAuditRecorder::create(&config.audit_log_path).await?);

        let (event_tx, event_rx) = mpsc::channel(RAW_EVENT_QUEUE);
        let (stable_tx, stable_rx) = mpsc::channel(STABLE_FILE_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut watcher = DropWatcher::new(config.monitor_path.clone());
        watcher.start(event_tx)?;

        let stabilizer = Stabilizer::new(config.stabilizer_settings(), event_rx, stable_tx);
        let stabilizer_handle = tokio::spawn(stabilizer.run());

        let settings = OrchestratorSettings {
            max_attempts: config.max_attempts,
            backoff_base: config.backoff_base(),
            max_concurrent_transfers: config.max_concurrent_transfers,
            shutdown_grace: config.shutdown_grace(),
            destination_path: config.destination_path.clone(),
        };
        let orchestrator = TransferOrchestrator::new(
            settings,
            transport as Arc<dyn Transport>,
            audit.clone() as Arc<dyn AuditRecorder>,
            stable_rx,
            shutdown_rx,
        );
        let orchestrator_handle = tokio::spawn(orchestrator.run());

        info!(
            "Daemon started: {} -> {}:{}",
            config.monitor_path.display(),
            config.remote_host,
            config.remote_port
        );

        Ok(DaemonHandle {
            watcher,
            shutdown_tx,
            stabilizer_handle,
            orchestrator_handle,
            audit,
        })
    }
}

/// Handle to a running daemon.
pub struct DaemonHandle {
    watcher: DropWatcher,
    shutdown_tx: watch::Sender<bool>,
    stabilizer_handle: JoinHandle<()>,
    orchestrator_handle: JoinHandle<()>,
    audit: Arc<FileAuditRecorder>,
}

impl DaemonHandle {
    /// Stop intake, give in-flight transfers their grace period, and flush
    /// the audit log.
    pub async fn stop(mut self) -> Result<()> {
        info!("Stopping daemon");

        // Dropping the watcher closes the event channel, which winds down
        // the stabilizer; the shutdown signal drains the orchestrator.
        self.watcher.stop();
        let _ = self.shutdown_tx.send(true);

        if let Err(e) = self.stabilizer_handle.await {
            error!("Stabilizer task failed: {}", e);
        }
        if let Err(e) = self.orchestrator_handle.await {
            error!("Orchestrator task failed: {}", e);
        }

        self.audit.flush().await?;
        info!("Daemon stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let dir = TempDir::new().unwrap();
        let monitor = dir.path().join("drop");
        std::fs::create_dir(&monitor).unwrap();

        let config = SkiffConfig {
            monitor_path: monitor,
            remote_host: "127.0.0.1".to_string(),
            remote_port: 1,
            destination_path: String::new(),
            identity_path: Some(dir.path().join("identity.key")),
            known_hosts_path: dir.path().join("known_hosts"),
            host_key_policy: skiff_crypto::HostKeyPolicy::Strict,
            audit_log_path: dir.path().join("audit.log"),
            max_attempts: 1,
            backoff_base_ms: 1,
            stability_polls: 1,
            poll_interval_ms: 20,
            max_concurrent_transfers: 2,
            shutdown_grace_ms: 200,
        };

        let handle = Daemon::start(config).await.unwrap();
        handle.stop().await.unwrap();
    }
}
