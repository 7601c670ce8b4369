//! TLS material for dialing etcd.
//!
//! Wraps the PEM-encoded CA bundle and client identity used for
//! mutual TLS with etcd, and turns it into a `rustls` client
//! configuration that negotiates HTTP/2.

use std::fmt;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::error::{EtcdError, EtcdResult};

/// PEM-encoded CA bundle and client certificate/key pair.
#[derive(Clone)]
pub struct TlsMaterial {
    /// CA bundle used to verify etcd's serving certificate.
    pub ca_pem: String,
    /// Client certificate chain presented to etcd.
    pub cert_pem: String,
    /// Client private key.
    pub key_pem: String,
    /// CA private key. Only present for freshly generated managed
    /// credentials.
    pub ca_key_pem: Option<String>,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_pem_len", &self.ca_pem.len())
            .field("cert_pem_len", &self.cert_pem.len())
            .field("has_ca_key", &self.ca_key_pem.is_some())
            .finish_non_exhaustive()
    }
}

impl TlsMaterial {
    pub fn new(
        ca_pem: impl Into<String>,
        cert_pem: impl Into<String>,
        key_pem: impl Into<String>,
    ) -> Self {
        Self {
            ca_pem: ca_pem.into(),
            cert_pem: cert_pem.into(),
            key_pem: key_pem.into(),
            ca_key_pem: None,
        }
    }

    /// Build a `rustls` client config: CA roots from the bundle, client
    /// auth from the certificate and key, ALPN `h2`.
    pub fn client_config(&self) -> EtcdResult<Arc<rustls::ClientConfig>> {
        let ca_certs = parse_certs(&self.ca_pem, "CA bundle")?;
        let mut roots = rustls::RootCertStore::empty();
        for cert in ca_certs {
            roots
                .add(cert)
                .map_err(|e| EtcdError::Tls(format!("invalid CA certificate: {e}")))?;
        }

        let chain = parse_certs(&self.cert_pem, "client certificate")?;
        let key = parse_key(&self.key_pem)?;

        let mut config = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| EtcdError::Tls(format!("protocol version error: {e}")))?
        .with_root_certificates(roots)
        .with_client_auth_cert(chain, key)
        .map_err(|e| EtcdError::Tls(format!("client certificate rejected: {e}")))?;

        config.alpn_protocols = vec![b"h2".to_vec()];
        Ok(Arc::new(config))
    }
}

fn parse_certs(pem: &str, what: &str) -> EtcdResult<Vec<CertificateDer<'static>>> {
    let mut reader = pem.as_bytes();
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EtcdError::Tls(format!("failed to parse {what}: {e}")))?;
    if certs.is_empty() {
        return Err(EtcdError::Tls(format!("{what} contains no certificates")));
    }
    Ok(certs)
}

fn parse_key(pem: &str) -> EtcdResult<PrivateKeyDer<'static>> {
    let mut reader = pem.as_bytes();
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| EtcdError::Tls(format!("failed to parse client key: {e}")))?
        .ok_or_else(|| EtcdError::Tls("client key PEM contains no private key".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::generate_client_material;

    #[test]
    fn generated_material_builds_client_config() {
        let material = generate_client_material("warden").unwrap();
        let config = material.client_config().unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[test]
    fn empty_ca_is_rejected() {
        let generated = generate_client_material("warden").unwrap();
        let material = TlsMaterial::new("", generated.cert_pem, generated.key_pem);
        match material.client_config() {
            Err(EtcdError::Tls(msg)) => assert!(msg.contains("CA bundle")),
            other => panic!("expected tls error, got {other:?}"),
        }
    }

    #[test]
    fn missing_key_is_rejected() {
        let generated = generate_client_material("warden").unwrap();
        let material = TlsMaterial::new(generated.ca_pem, generated.cert_pem, "not a key");
        match material.client_config() {
            Err(EtcdError::Tls(msg)) => assert!(msg.contains("no private key")),
            other => panic!("expected tls error, got {other:?}"),
        }
    }

    #[test]
    fn debug_does_not_leak_key() {
        let material = TlsMaterial::new("ca", "cert", "SECRET-KEY");
        assert!(!format!("{material:?}").contains("SECRET-KEY"));
    }
}
