//! Authenticated QUIC transport for skiff file transfers.
//!
//! The sending side ([`TransportClient`]) opens one short-lived mTLS session
//! per file; the receiving side ([`UploadServer`], the "harbor") verifies the
//! declared digest before committing anything to disk. Failures are classified
//! by [`TransportError`] so the orchestrator knows which ones are worth
//! retrying.

pub mod client;
pub mod config;
pub mod errors;
pub mod protocol;
pub mod server;

pub use client::TransportClient;
pub use config::QuicSettings;
pub use errors::{Result, TransportError};
pub use protocol::WireMessage;
pub use server::UploadServer;
