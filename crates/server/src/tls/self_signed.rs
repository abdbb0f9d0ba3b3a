//! Self-signed bootstrap certificate.
//!
//! Generated once on first start and persisted, so the browser warning stays
//! stable across restarts while the server is unconfigured.

use rustls::pki_types::PrivateKeyDer;
use rustls::ServerConfig;
use std::sync::Arc;
use ubergang_common::{Error, Result};

/// Generate a fresh P-256 ECDSA certificate, returning (cert PEM, key PEM).
pub fn generate() -> Result<(Vec<u8>, Vec<u8>)> {
    let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| Error::Crypto(format!("key generation failed: {e}")))?;
    let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .map_err(|e| Error::Crypto(format!("certificate params: {e}")))?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "Ubergang");
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| Error::Crypto(format!("self-sign failed: {e}")))?;
    Ok((
        cert.pem().into_bytes(),
        key_pair.serialize_pem().into_bytes(),
    ))
}

/// Build a rustls server config from PEM-encoded certificate chain and key.
pub fn server_config_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Arc<ServerConfig>> {
    let certs = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Crypto(format!("bad certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(Error::Crypto("no certificates in PEM".into()));
    }
    let key: PrivateKeyDer = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| Error::Crypto(format!("bad key PEM: {e}")))?
        .ok_or_else(|| Error::Crypto("no private key in PEM".into()))?;
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Crypto(format!("TLS config: {e}")))?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_pair_builds_config() {
        let (cert_pem, key_pem) = generate().unwrap();
        assert!(std::str::from_utf8(&cert_pem)
            .unwrap()
            .contains("BEGIN CERTIFICATE"));
        server_config_from_pem(&cert_pem, &key_pem).unwrap();
    }
}
