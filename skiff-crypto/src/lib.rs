pub mod certificate;
pub mod errors;
pub mod identity;
pub mod trust;

pub use certificate::{extract_device_id, CertificateGenerator, TlsConfig};
pub use errors::{CryptoError, Result};
pub use identity::{DeviceId, DeviceIdentity};
pub use trust::{DropVerifier, HarborVerifier, HostKeyPolicy, KnownHosts};
