//! Transfer orchestration for skiff.
//!
//! [`Daemon::start`] wires the drop-directory watcher, the stabilizer, the
//! transfer orchestrator and the audit log together; [`DaemonHandle::stop`]
//! drains them gracefully.

pub mod audit;
pub mod config;
pub mod daemon;
pub mod errors;
pub mod orchestrator;

pub use audit::{AuditRecorder, ErrorKind, FileAuditRecorder, MemoryAuditRecorder, TransferOutcome};
pub use config::SkiffConfig;
pub use daemon::{Daemon, DaemonHandle};
pub use errors::{DaemonError, Result};
pub use orchestrator::{OrchestratorSettings, TransferOrchestrator, Transport};
