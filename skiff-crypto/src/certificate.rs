use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::{CryptoError, Result};
use crate::identity::{DeviceId, DeviceIdentity};
use crate::trust::{DropVerifier, HarborVerifier};

/// Custom X.509 extension OID carrying the skiff device ID.
///
/// Experimental private-enterprise arc; both sides of a connection read the
/// raw Ed25519 public key out of this extension to identify the peer.
pub(crate) const DEVICE_ID_OID: &[u64] = &[1, 3, 6, 1, 4, 1, 54392, 1];

/// Generates TLS certificates for secure QUIC connections between skiff devices.
///
/// Certificates are self-signed X.509 with the device's identity embedded in a
/// custom extension. They are not anchored to any CA; trust comes entirely
/// from the host-key policy (pinning in the known-hosts file) on the client
/// side and the allowed-sender list on the harbor side.
///
/// # Example
///
/// ```rust
/// use skiff_crypto::{CertificateGenerator, DeviceIdentity};
///
/// let identity = DeviceIdentity::generate("drop-box").unwrap();
/// let (cert_chain, private_key) =
///     CertificateGenerator::generate_device_certificate(&identity).unwrap();
///
/// // cert_chain and private_key can now be used with rustls/quinn
/// ```
pub struct CertificateGenerator;

impl CertificateGenerator {
    /// Generates a self-signed TLS certificate for a device's long-term identity.
    ///
    /// The certificate embeds the device ID in the skiff custom extension and
    /// is valid for one year. A fresh TLS keypair is generated per call; the
    /// binding to the Ed25519 identity is through the extension, not the TLS key.
    pub fn generate_device_certificate(
        identity: &DeviceIdentity,
    ) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let mut params = CertificateParams::new(vec![identity.device_name().to_string()])
            .map_err(|e| CryptoError::CertificateGeneration(e.to_string()))?;

        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after = params.not_before + time::Duration::days(365);

        let device_id = identity.device_id();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, identity.device_name());
        params
            .distinguished_name
            .push(DnType::OrganizationName, "Skiff");

        // SANs for local and remote connections
        params.subject_alt_names = vec![
            SanType::DnsName(identity.device_name().try_into().map_err(|e| {
                CryptoError::CertificateGeneration(format!("Invalid DNS name: {:?}", e))
            })?),
            SanType::IpAddress(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)),
            SanType::IpAddress(std::net::IpAddr::V6(std::net::Ipv6Addr::LOCALHOST)),
        ];

        params.custom_extensions = vec![rcgen::CustomExtension::from_oid_content(
            DEVICE_ID_OID,
            device_id.as_bytes().to_vec(),
        )];

        let key_pair =
            KeyPair::generate().map_err(|e| CryptoError::CertificateGeneration(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| CryptoError::CertificateGeneration(e.to_string()))?;
        let cert_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(key_pair.serialize_der()).map_err(|e| {
            CryptoError::CertificateGeneration(format!("Failed to serialize key: {:?}", e))
        })?;

        debug!(
            "Generated certificate for device: {}",
            identity.device_name()
        );

        Ok((vec![cert_der], key_der))
    }
}

/// Extract the skiff device ID from a peer certificate, if present.
pub fn extract_device_id(cert: &CertificateDer) -> Option<DeviceId> {
    use x509_parser::prelude::*;

    let oid_string = DEVICE_ID_OID
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(".");

    match X509Certificate::from_der(cert) {
        Ok((_, cert)) => {
            for ext in cert.extensions() {
                if ext.oid.to_string() == oid_string {
                    if let Ok(device_id) = DeviceId::from_bytes(ext.value) {
                        return Some(device_id);
                    }
                }
            }
            debug!("No skiff device ID extension found in certificate");
            None
        }
        Err(e) => {
            warn!("Failed to parse certificate: {}", e);
            None
        }
    }
}

/// TLS configuration builder for skiff connections.
///
/// There is deliberately no accept-anything path here: the client side always
/// goes through a [`HarborVerifier`] (strict or trust-on-first-use pinning)
/// and the harbor side always requires an authenticated client certificate.
pub struct TlsConfig;

impl TlsConfig {
    /// Create client TLS configuration verifying the harbor against the
    /// known-hosts store.
    pub fn client_config(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
        verifier: Arc<HarborVerifier>,
    ) -> Result<rustls::ClientConfig> {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_client_auth_cert(cert_chain, private_key)
            .map_err(|e| CryptoError::CertificateGeneration(e.to_string()))?;

        Ok(config)
    }

    /// Create server TLS configuration requiring client certificates (mTLS).
    pub fn server_config(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
        client_verifier: Arc<DropVerifier>,
    ) -> Result<rustls::ServerConfig> {
        let config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| CryptoError::CertificateGeneration(e.to_string()))?;

        Ok(config)
    }
}
