use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use skiff_crypto::HostKeyPolicy;
use skiff_watch::StabilizerSettings;

use crate::errors::{DaemonError, Result};

/// Daemon configuration, loaded once from TOML and treated as immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SkiffConfig {
    /// Directory watched for new files
    pub monitor_path: PathBuf,

    /// Harbor hostname or address
    pub remote_host: String,

    /// Harbor port
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,

    /// Harbor-relative directory uploads land in
    #[serde(default)]
    pub destination_path: String,

    /// Device identity key location; generated on first run when absent
    #[serde(default)]
    pub identity_path: Option<PathBuf>,

    /// Known-hosts file pinning the harbor's device ID
    #[serde(default = "default_known_hosts_path")]
    pub known_hosts_path: PathBuf,

    /// How an unknown or changed harbor identity is treated
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,

    /// Audit log destination
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: PathBuf,

    /// Total transfer attempts per file (first try included)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the first retry; doubles per retry
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Consecutive unchanged-size polls before a file is considered settled
    #[serde(default = "default_stability_polls")]
    pub stability_polls: u32,

    /// Interval between size polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Cap on transfers running at once
    #[serde(default = "default_max_concurrent_transfers")]
    pub max_concurrent_transfers: usize,

    /// How long in-flight transfers get to finish on shutdown
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_remote_port() -> u16 {
    9876
}

fn default_known_hosts_path() -> PathBuf {
    PathBuf::from("known_hosts")
}

fn default_audit_log_path() -> PathBuf {
    PathBuf::from("skiff-audit.log")
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_stability_polls() -> u32 {
    2
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_concurrent_transfers() -> usize {
    8
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

impl SkiffConfig {
    /// Load and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DaemonError::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config: SkiffConfig = toml::from_str(&contents)
            .map_err(|e| DaemonError::Config(format!("Invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.remote_host.is_empty() {
            return Err(DaemonError::Config("remote_host must not be empty".into()));
        }
        if self.max_attempts == 0 {
            return Err(DaemonError::Config("max_attempts must be at least 1".into()));
        }
        if self.stability_polls == 0 {
            return Err(DaemonError::Config(
                "stability_polls must be at least 1".into(),
            ));
        }
        if self.max_concurrent_transfers == 0 {
            return Err(DaemonError::Config(
                "max_concurrent_transfers must be at least 1".into(),
            ));
        }
        if !self.monitor_path.is_dir() {
            return Err(DaemonError::Config(format!(
                "monitor_path is not a directory: {}",
                self.monitor_path.display()
            )));
        }
        Ok(())
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn stabilizer_settings(&self) -> StabilizerSettings {
        StabilizerSettings {
            stability_polls: self.stability_polls,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("skiff.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let dir = TempDir::new().unwrap();
        let body = format!(
            "monitor_path = \"{}\"\nremote_host = \"harbor.local\"\n",
            dir.path().display()
        );
        let path = write_config(&dir, &body);

        let config = SkiffConfig::load(&path).unwrap();
        assert_eq!(config.remote_port, 9876);
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_base_ms, 1000);
        assert_eq!(config.stability_polls, 2);
        assert_eq!(config.poll_interval_ms, 500);
        assert_eq!(config.max_concurrent_transfers, 8);
        assert_eq!(config.host_key_policy, HostKeyPolicy::Strict);
    }

    #[test]
    fn test_policy_parsing() {
        let dir = TempDir::new().unwrap();
        let body = format!(
            "monitor_path = \"{}\"\nremote_host = \"harbor.local\"\nhost_key_policy = \"trust-on-first-use\"\n",
            dir.path().display()
        );
        let path = write_config(&dir, &body);

        let config = SkiffConfig::load(&path).unwrap();
        assert_eq!(config.host_key_policy, HostKeyPolicy::TrustOnFirstUse);
    }

    #[test]
    fn test_rejects_zero_attempts() {
        let dir = TempDir::new().unwrap();
        let body = format!(
            "monitor_path = \"{}\"\nremote_host = \"harbor.local\"\nmax_attempts = 0\n",
            dir.path().display()
        );
        let path = write_config(&dir, &body);

        assert!(matches!(
            SkiffConfig::load(&path),
            Err(DaemonError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_field() {
        let dir = TempDir::new().unwrap();
        let body = format!(
            "monitor_path = \"{}\"\nremote_host = \"harbor.local\"\nremot_port = 1\n",
            dir.path().display()
        );
        let path = write_config(&dir, &body);

        assert!(matches!(
            SkiffConfig::load(&path),
            Err(DaemonError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_missing_monitor_dir() {
        let dir = TempDir::new().unwrap();
        let body = format!(
            "monitor_path = \"{}\"\nremote_host = \"harbor.local\"\n",
            dir.path().join("nope").display()
        );
        let path = write_config(&dir, &body);

        assert!(matches!(
            SkiffConfig::load(&path),
            Err(DaemonError::Config(_))
        ));
    }
}
