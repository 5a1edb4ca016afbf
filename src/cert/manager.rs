//! Dynamic certificate issuance and caching
//!
//! The manager signs one leaf certificate per server name with the root CA
//! and caches it for the process lifetime. All leaves share a single
//! RSA-2048 key generated at startup, so issuance is a signing operation
//! rather than a key generation. The cache is get-or-create with the miss
//! path serialized, so concurrent first-touch of a hostname issues exactly
//! one certificate.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};
use tracing::{debug, error};

use crate::{Error, Result};

/// Organization name stamped into every synthesized certificate.
const LEAF_ORGANIZATION: &str = "echo proxy";

/// Issues and caches leaf certificates signed by the root CA.
pub struct CertificateManager {
    issuer: Issuer<'static, KeyPair>,
    leaf_key: KeyPair,
    leaf_key_der: PrivateKeyDer<'static>,
    cache: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl CertificateManager {
    /// Build the manager from root CA PEM and key, generating the shared
    /// RSA-2048 leaf key.
    pub(crate) fn new(ca_cert_pem: &str, ca_key: KeyPair) -> Result<Self> {
        let issuer = Issuer::from_ca_cert_pem(ca_cert_pem, ca_key)
            .map_err(|e| Error::config(format!("failed to parse root CA certificate: {e}")))?;

        let leaf_key = KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, rcgen::RsaKeySize::_2048)
            .map_err(|e| Error::config(format!("failed to generate leaf key: {e}")))?;
        let leaf_key_der =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));

        Ok(Self {
            issuer,
            leaf_key,
            leaf_key_der,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Get the cached certificate for `server_name`, issuing it on first use.
    pub fn get_certificate(&self, server_name: &str) -> Result<Arc<CertifiedKey>> {
        if let Some(cert) = self.cache.read().get(server_name) {
            return Ok(Arc::clone(cert));
        }

        // The write lock serializes the miss path: a concurrent first-touch
        // issues the certificate once.
        let mut cache = self.cache.write();
        if let Some(cert) = cache.get(server_name) {
            return Ok(Arc::clone(cert));
        }

        debug!("[CERT] issuing certificate for {}", server_name);
        let certified = Arc::new(self.issue(server_name)?);
        cache.insert(server_name.to_owned(), Arc::clone(&certified));
        Ok(certified)
    }

    fn issue(&self, server_name: &str) -> Result<CertifiedKey> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, server_name);
        dn.push(DnType::OrganizationName, LEAF_ORGANIZATION);
        params.distinguished_name = dn;

        let mut serial = [0u8; 16];
        rand::thread_rng().fill(&mut serial[..]);
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        params.not_before = OffsetDateTime::now_utc() - Duration::hours(24);
        params.not_after = OffsetDateTime::now_utc() + Duration::days(365);

        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.is_ca = IsCa::ExplicitNoCa;

        params.subject_alt_names = match server_name.parse::<IpAddr>() {
            Ok(ip) => vec![SanType::IpAddress(ip)],
            Err(_) => vec![SanType::DnsName(
                server_name
                    .try_into()
                    .map_err(|e| Error::cert_issuance(server_name, format!("invalid name: {e}")))?,
            )],
        };

        let cert = params
            .signed_by(&self.leaf_key, &self.issuer)
            .map_err(|e| Error::cert_issuance(server_name, e.to_string()))?;

        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&self.leaf_key_der)
            .map_err(|e| Error::cert_issuance(server_name, e.to_string()))?;

        Ok(CertifiedKey::new(vec![cert.der().clone()], signing_key))
    }

    /// SNI resolver for a MITM TLS server, falling back to `fallback` when
    /// the ClientHello carries no server name.
    pub(crate) fn resolver(self: &Arc<Self>, fallback: impl Into<String>) -> Arc<SniResolver> {
        Arc::new(SniResolver {
            manager: Arc::clone(self),
            fallback: fallback.into(),
        })
    }
}

impl fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateManager")
            .field("cached", &self.cache.read().len())
            .finish_non_exhaustive()
    }
}

/// Picks a certificate during the TLS ClientHello by SNI.
#[derive(Debug)]
pub(crate) struct SniResolver {
    manager: Arc<CertificateManager>,
    fallback: String,
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name().unwrap_or(&self.fallback);
        match self.manager.get_certificate(server_name) {
            Ok(cert) => Some(cert),
            Err(e) => {
                error!("[CERT] resolve failed for {}: {}", server_name, e);
                None
            }
        }
    }
}
