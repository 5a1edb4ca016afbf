//! Root CA material decoding
//!
//! The proxy is constructed from two PEM buffers: the root CA certificate
//! and its private key. Accepted key PEM types are `RSA PRIVATE KEY`
//! (PKCS#1) and `PRIVATE KEY` (PKCS#8); anything else is rejected at
//! startup.

use rcgen::KeyPair;
use rustls::pki_types::PrivateKeyDer;
use rustls_pemfile::Item;

use crate::{Error, Result};

/// Decode the root CA certificate and key from PEM.
///
/// Returns the certificate PEM (validated to contain a certificate block)
/// and the parsed signing key.
pub(crate) fn load_root_ca(cert_pem: &[u8], key_pem: &[u8]) -> Result<(String, KeyPair)> {
    let mut cert_reader = cert_pem;
    match rustls_pemfile::read_one(&mut cert_reader) {
        Ok(Some(Item::X509Certificate(_))) => {}
        Ok(_) => return Err(Error::config("failed to decode certificate PEM")),
        Err(e) => return Err(Error::config(format!("failed to read certificate PEM: {e}"))),
    }
    let cert_pem = std::str::from_utf8(cert_pem)
        .map_err(|_| Error::config("certificate PEM is not valid UTF-8"))?
        .to_owned();

    let mut key_reader = key_pem;
    let key_der: PrivateKeyDer<'static> = match rustls_pemfile::read_one(&mut key_reader) {
        Ok(Some(Item::Pkcs1Key(der))) => der.into(),
        Ok(Some(Item::Pkcs8Key(der))) => der.into(),
        Ok(Some(Item::Sec1Key(_))) => {
            return Err(Error::config("unsupported key type: EC PRIVATE KEY"))
        }
        Ok(Some(_)) | Ok(None) => return Err(Error::config("failed to decode private key PEM")),
        Err(e) => return Err(Error::config(format!("failed to read private key PEM: {e}"))),
    };

    let key = KeyPair::try_from(&key_der)
        .map_err(|e| Error::config(format!("failed to parse private key: {e}")))?;

    Ok((cert_pem, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, IsCa};

    fn test_ca_pem() -> (String, String) {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["test root".to_string()]).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn loads_pkcs8_key() {
        let (cert_pem, key_pem) = test_ca_pem();
        assert!(key_pem.contains("BEGIN PRIVATE KEY"));
        let loaded = load_root_ca(cert_pem.as_bytes(), key_pem.as_bytes());
        assert!(loaded.is_ok(), "{:?}", loaded.err());
    }

    #[test]
    fn rejects_garbage_certificate() {
        let (_, key_pem) = test_ca_pem();
        let err = load_root_ca(b"not a certificate", key_pem.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_key_pem_of_wrong_type() {
        let (cert_pem, _) = test_ca_pem();
        // A certificate block where a key is expected.
        let err = load_root_ca(cert_pem.as_bytes(), cert_pem.as_bytes()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_empty_key() {
        let (cert_pem, _) = test_ca_pem();
        let err = load_root_ca(cert_pem.as_bytes(), b"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
