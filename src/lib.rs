//! Skiff integration tests and workspace root
//!
//! This crate serves as the root of the Skiff workspace and contains
//! integration tests that exercise the full event-to-transfer pipeline
//! across the member crates.

// Re-export major components for integration testing
pub use skiff_crypto as crypto;
pub use skiff_daemon as daemon;
pub use skiff_fingerprint as fingerprint;
pub use skiff_quic as quic;
pub use skiff_watch as watch;
