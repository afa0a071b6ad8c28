//! Host trust for outbound transfers and sender trust for the harbor.
//!
//! The original design weakness this module exists to fix: blindly accepting
//! whatever identity the remote presents. Host verification is an explicit
//! configuration choice with `strict` as the safe default; trust-on-first-use
//! pins the harbor's device ID on first contact and refuses anything else
//! afterwards.

use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::certificate::extract_device_id;
use crate::errors::{CryptoError, Result};
use crate::identity::DeviceId;

/// How an unknown remote identity is handled on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HostKeyPolicy {
    /// Only connect to a harbor whose device ID is already pinned.
    #[default]
    Strict,
    /// Pin an unknown harbor on first contact; reject any later change.
    TrustOnFirstUse,
}

impl std::str::FromStr for HostKeyPolicy {
    type Err = CryptoError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "strict" => Ok(HostKeyPolicy::Strict),
            "trust-on-first-use" => Ok(HostKeyPolicy::TrustOnFirstUse),
            other => Err(CryptoError::TrustStore(format!(
                "Unknown host key policy: {}",
                other
            ))),
        }
    }
}

/// File-backed map of `host:port` endpoints to pinned harbor device IDs.
///
/// The format is one entry per line, `endpoint` and hex device ID separated
/// by whitespace. Lines starting with `#` are ignored.
#[derive(Debug)]
pub struct KnownHosts {
    path: PathBuf,
    entries: HashMap<String, DeviceId>,
}

impl KnownHosts {
    /// Load the known-hosts file, treating a missing file as empty.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut entries = HashMap::new();

        match std::fs::read_to_string(&path) {
            Ok(content) => {
                for (lineno, line) in content.lines().enumerate() {
                    let line = line.trim();
                    if line.is_empty() || line.starts_with('#') {
                        continue;
                    }
                    let mut parts = line.split_whitespace();
                    let (endpoint, id_hex) = match (parts.next(), parts.next()) {
                        (Some(e), Some(h)) => (e, h),
                        _ => {
                            return Err(CryptoError::TrustStore(format!(
                                "Malformed known-hosts entry at {}:{}",
                                path.display(),
                                lineno + 1
                            )))
                        }
                    };
                    let device_id: DeviceId = id_hex.parse()?;
                    entries.insert(endpoint.to_string(), device_id);
                }
                debug!(
                    "Loaded {} known host(s) from {}",
                    entries.len(),
                    path.display()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No known-hosts file at {}", path.display());
            }
            Err(e) => return Err(CryptoError::Io(e)),
        }

        Ok(Self { path, entries })
    }

    /// Look up the pinned device ID for an endpoint.
    pub fn get(&self, endpoint: &str) -> Option<&DeviceId> {
        self.entries.get(endpoint)
    }

    /// Pin a device ID for an endpoint and persist the store.
    pub fn pin(&mut self, endpoint: &str, device_id: DeviceId) -> Result<()> {
        info!("Pinning harbor {} as {}", endpoint, device_id);
        self.entries.insert(endpoint.to_string(), device_id);
        self.save()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut content = String::from("# skiff known hosts\n");
        let mut endpoints: Vec<_> = self.entries.keys().collect();
        endpoints.sort();
        for endpoint in endpoints {
            content.push_str(&format!(
                "{} {}\n",
                endpoint,
                self.entries[endpoint].to_hex()
            ));
        }

        // Write to a temporary file first, then atomically rename
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

fn check_validity_period(cert_der: &CertificateDer, now: UnixTime) -> std::result::Result<(), rustls::Error> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der)
        .map_err(|_| rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding))?;

    let now_seconds = now.as_secs();
    if (cert.validity().not_before.timestamp() as u64) > now_seconds
        || (cert.validity().not_after.timestamp() as u64) < now_seconds
    {
        return Err(rustls::Error::InvalidCertificate(
            rustls::CertificateError::Expired,
        ));
    }
    Ok(())
}

fn unknown_peer_error(detail: String) -> rustls::Error {
    rustls::Error::InvalidCertificate(rustls::CertificateError::Other(rustls::OtherError(
        std::sync::Arc::new(CryptoError::CertificateValidation(detail)),
    )))
}

/// Certificate verifier for the client side of a transfer.
///
/// Validates the harbor's self-signed certificate, extracts its device ID and
/// applies the configured [`HostKeyPolicy`] against the known-hosts store.
/// A pin written under trust-on-first-use is persisted immediately, so a
/// harbor that later presents a different identity is rejected.
#[derive(Debug)]
pub struct HarborVerifier {
    endpoint: String,
    policy: HostKeyPolicy,
    known_hosts: Mutex<KnownHosts>,
}

impl HarborVerifier {
    pub fn new(endpoint: impl Into<String>, policy: HostKeyPolicy, known_hosts: KnownHosts) -> Self {
        Self {
            endpoint: endpoint.into(),
            policy,
            known_hosts: Mutex::new(known_hosts),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for HarborVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        check_validity_period(end_entity, now)?;

        // Self-signed certs never carry intermediates
        if !intermediates.is_empty() {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::BadEncoding,
            ));
        }

        let device_id = extract_device_id(end_entity)
            .ok_or_else(|| unknown_peer_error("No device ID found in certificate".to_string()))?;

        let mut known_hosts = self
            .known_hosts
            .lock()
            .map_err(|_| unknown_peer_error("Known-hosts store poisoned".to_string()))?;

        match known_hosts.get(&self.endpoint) {
            Some(pinned) if *pinned == device_id => {
                debug!("Harbor {} matches pinned identity {}", self.endpoint, device_id);
                Ok(rustls::client::danger::ServerCertVerified::assertion())
            }
            Some(pinned) => {
                warn!(
                    "Harbor {} identity changed: pinned {}, presented {}",
                    self.endpoint, pinned, device_id
                );
                Err(unknown_peer_error(format!(
                    "Host identity for {} changed (pinned {}, presented {})",
                    self.endpoint, pinned, device_id
                )))
            }
            None => match self.policy {
                HostKeyPolicy::Strict => {
                    warn!(
                        "Harbor {} is not in the known-hosts store (strict policy)",
                        self.endpoint
                    );
                    Err(rustls::Error::InvalidCertificate(
                        rustls::CertificateError::UnknownIssuer,
                    ))
                }
                HostKeyPolicy::TrustOnFirstUse => {
                    known_hosts
                        .pin(&self.endpoint, device_id)
                        .map_err(|e| unknown_peer_error(format!("Failed to pin host: {}", e)))?;
                    Ok(rustls::client::danger::ServerCertVerified::assertion())
                }
            },
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

/// Client certificate verifier for the harbor side (mTLS).
///
/// Requires every sender to present a valid skiff certificate. When the
/// allowed-senders list is empty any authenticated device may upload;
/// otherwise the sender's device ID must be on the list.
#[derive(Debug)]
pub struct DropVerifier {
    allowed_senders: Vec<DeviceId>,
}

impl DropVerifier {
    pub fn new(allowed_senders: Vec<DeviceId>) -> Self {
        Self { allowed_senders }
    }

    /// Accept any sender that presents a valid skiff certificate.
    pub fn allow_any() -> Self {
        Self {
            allowed_senders: Vec::new(),
        }
    }

    fn is_allowed(&self, device_id: &DeviceId) -> bool {
        self.allowed_senders.is_empty() || self.allowed_senders.contains(device_id)
    }
}

impl rustls::server::danger::ClientCertVerifier for DropVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        // Self-signed certificates have no root subjects to hint
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        check_validity_period(end_entity, now)?;

        if !intermediates.is_empty() {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::BadEncoding,
            ));
        }

        let device_id = extract_device_id(end_entity)
            .ok_or_else(|| unknown_peer_error("No device ID found in certificate".to_string()))?;

        if !self.is_allowed(&device_id) {
            warn!("Rejecting upload from unlisted sender {}", device_id);
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::UnknownIssuer,
            ));
        }

        debug!("Sender certificate verified for device: {}", device_id);
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::CertificateGenerator;
    use crate::identity::DeviceIdentity;
    use rustls::client::danger::ServerCertVerifier;
    use tempfile::tempdir;

    fn device_cert(name: &str) -> (DeviceId, CertificateDer<'static>) {
        let identity = DeviceIdentity::generate(name).unwrap();
        let (mut chain, _key) =
            CertificateGenerator::generate_device_certificate(&identity).unwrap();
        (identity.device_id(), chain.remove(0))
    }

    #[test]
    fn test_known_hosts_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");

        let mut hosts = KnownHosts::load(&path).unwrap();
        assert!(hosts.get("harbor:9700").is_none());

        let id = DeviceId([9u8; 32]);
        hosts.pin("harbor:9700", id.clone()).unwrap();

        let reloaded = KnownHosts::load(&path).unwrap();
        assert_eq!(reloaded.get("harbor:9700"), Some(&id));
    }

    #[test]
    fn test_known_hosts_rejects_malformed_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, "just-an-endpoint-no-id\n").unwrap();

        assert!(KnownHosts::load(&path).is_err());
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("strict".parse::<HostKeyPolicy>().unwrap(), HostKeyPolicy::Strict);
        assert_eq!(
            "trust-on-first-use".parse::<HostKeyPolicy>().unwrap(),
            HostKeyPolicy::TrustOnFirstUse
        );
        assert!("auto-accept".parse::<HostKeyPolicy>().is_err());
    }

    #[test]
    fn test_strict_rejects_unknown_harbor() {
        let dir = tempdir().unwrap();
        let hosts = KnownHosts::load(dir.path().join("known_hosts")).unwrap();
        let verifier = HarborVerifier::new("harbor:9700", HostKeyPolicy::Strict, hosts);

        let (_, cert) = device_cert("harbor");
        let name = ServerName::try_from("localhost").unwrap();
        let result = verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::now());
        assert!(result.is_err());
    }

    #[test]
    fn test_tofu_pins_then_detects_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        let name = ServerName::try_from("localhost").unwrap();

        let (first_id, first_cert) = device_cert("harbor");
        let (_, impostor_cert) = device_cert("impostor");

        // First contact pins the harbor
        let hosts = KnownHosts::load(&path).unwrap();
        let verifier = HarborVerifier::new("harbor:9700", HostKeyPolicy::TrustOnFirstUse, hosts);
        verifier
            .verify_server_cert(&first_cert, &[], &name, &[], UnixTime::now())
            .unwrap();

        let reloaded = KnownHosts::load(&path).unwrap();
        assert_eq!(reloaded.get("harbor:9700"), Some(&first_id));

        // A different identity for the same endpoint is rejected even under TOFU
        let verifier =
            HarborVerifier::new("harbor:9700", HostKeyPolicy::TrustOnFirstUse, reloaded);
        let result = verifier.verify_server_cert(&impostor_cert, &[], &name, &[], UnixTime::now());
        assert!(result.is_err());

        // The original identity still verifies
        let hosts = KnownHosts::load(&path).unwrap();
        let verifier = HarborVerifier::new("harbor:9700", HostKeyPolicy::Strict, hosts);
        verifier
            .verify_server_cert(&first_cert, &[], &name, &[], UnixTime::now())
            .unwrap();
    }

    #[test]
    fn test_drop_verifier_sender_list() {
        let allowed = DeviceId([1u8; 32]);
        let other = DeviceId([2u8; 32]);

        let verifier = DropVerifier::new(vec![allowed.clone()]);
        assert!(verifier.is_allowed(&allowed));
        assert!(!verifier.is_allowed(&other));

        let open = DropVerifier::allow_any();
        assert!(open.is_allowed(&other));
    }
}
