//! TLS termination: SNI-driven certificate selection against the store.
//!
//! The resolver is installed as the server's certificate callback. Every
//! handshake looks the requested name up in the routing store, so freshly
//! synced secrets take effect without restarting a listener. Names with no
//! matching record are served a generated placeholder certificate instead of
//! failing the handshake, giving operators catch-all behavior.

use std::fmt;
use std::io::BufReader;
use std::sync::Arc;

use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use thiserror::Error;
use tracing::{debug, warn};

use super::store::RoutingStore;

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("invalid certificate material: {0}")]
    Parse(String),
}

/// Parse PEM cert/key payloads into key material usable for handshakes.
pub(crate) fn parse_certified_key(
    cert_pem: &[u8],
    key_pem: &[u8],
) -> Result<CertifiedKey, CertificateError> {
    if cert_pem.is_empty() || key_pem.is_empty() {
        return Err(CertificateError::Parse(
            "missing certificate or key payload".to_string(),
        ));
    }

    let mut cert_reader = BufReader::new(cert_pem);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertificateError::Parse(format!("bad certificate PEM: {e}")))?;
    if certs.is_empty() {
        return Err(CertificateError::Parse(
            "no certificate found in payload".to_string(),
        ));
    }

    let mut key_reader = BufReader::new(key_pem);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .map_err(|e| CertificateError::Parse(format!("bad key PEM: {e}")))?
        .ok_or_else(|| CertificateError::Parse("no private key found in payload".to_string()))?;

    let signing_key = any_supported_type(&key)
        .map_err(|e| CertificateError::Parse(format!("unsupported private key: {e}")))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// SNI certificate selection backed by the routing store.
pub struct CertResolver {
    store: Arc<RoutingStore>,
    fallback: Arc<CertifiedKey>,
}

impl CertResolver {
    pub fn new(store: Arc<RoutingStore>, fallback: Arc<CertifiedKey>) -> Self {
        Self { store, fallback }
    }

    /// Exact match first, then a single-label wildcard
    /// (`api.example.com` -> `*.example.com`).
    fn lookup(&self, server_name: &str) -> Option<Arc<super::store::CertificateRecord>> {
        let name = server_name.to_ascii_lowercase();
        if let Some(record) = self.store.certificate_by_cn(&name) {
            return Some(record);
        }
        let dot = name.find('.')?;
        self.store.certificate_by_cn(&format!("*{}", &name[dot..]))
    }
}

impl fmt::Debug for CertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for CertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let Some(server_name) = client_hello.server_name() else {
            debug!("handshake without SNI, serving placeholder certificate");
            return Some(self.fallback.clone());
        };

        match self.lookup(server_name) {
            Some(record) => match record.certified_key() {
                Ok(key) => Some(key),
                Err(error) => {
                    warn!(server_name, %error, "certificate for SNI name is unusable");
                    None
                }
            },
            None => {
                debug!(server_name, "no certificate for SNI name, serving placeholder");
                Some(self.fallback.clone())
            }
        }
    }
}

/// Server-side TLS configuration with the store-backed resolver installed.
/// The proxy speaks HTTP/1 only, so that is all we offer over ALPN.
pub fn server_config(resolver: Arc<CertResolver>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}

/// A generated self-signed certificate used when no synced certificate
/// matches a handshake.
pub struct PlaceholderCert {
    pub certified: Arc<CertifiedKey>,
    /// DER copy, exposed so tests can trust the placeholder.
    pub cert_der: CertificateDer<'static>,
}

/// Generate the placeholder: SAN `localhost`, serial 1, ten-year validity,
/// server-auth usage.
pub fn generate_placeholder() -> Result<PlaceholderCert, CertificateError> {
    let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()])
        .map_err(|e| CertificateError::Parse(format!("placeholder params: {e}")))?;
    params.serial_number = Some(rcgen::SerialNumber::from(vec![1u8]));
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(10 * 365);
    params.key_usages = vec![
        rcgen::KeyUsagePurpose::DigitalSignature,
        rcgen::KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

    let key_pair = rcgen::KeyPair::generate()
        .map_err(|e| CertificateError::Parse(format!("placeholder key: {e}")))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertificateError::Parse(format!("placeholder cert: {e}")))?;

    let cert_der = cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let signing_key = any_supported_type(&key_der)
        .map_err(|e| CertificateError::Parse(format!("placeholder signing key: {e}")))?;

    Ok(PlaceholderCert {
        certified: Arc::new(CertifiedKey::new(vec![cert_der.clone()], signing_key)),
        cert_der,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::store::CERT_CN_ANNOTATION;
    use gantry_cluster::{ObjectMeta, Secret};

    fn store_with_cert(cn: &str) -> Arc<RoutingStore> {
        let generated = rcgen::generate_simple_self_signed(vec!["test.invalid".to_string()])
            .expect("generate cert");
        let mut secret = Secret {
            metadata: ObjectMeta {
                namespace: "default".to_string(),
                name: "tls".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        secret
            .metadata
            .annotations
            .insert(CERT_CN_ANNOTATION.to_string(), cn.to_string());
        secret
            .data
            .insert("tls.crt".to_string(), generated.cert.pem().into_bytes());
        secret.data.insert(
            "tls.key".to_string(),
            generated.key_pair.serialize_pem().into_bytes(),
        );

        let store = Arc::new(RoutingStore::new());
        store.apply_secret("default", "tls", Some(&secret));
        store
    }

    fn resolver(store: Arc<RoutingStore>) -> CertResolver {
        let placeholder = generate_placeholder().expect("placeholder");
        CertResolver::new(store, placeholder.certified)
    }

    #[test]
    fn exact_name_resolves() {
        let resolver = resolver(store_with_cert("api.example.test"));
        assert!(resolver.lookup("api.example.test").is_some());
        assert!(resolver.lookup("API.Example.Test").is_some());
        assert!(resolver.lookup("other.example.test").is_none());
    }

    #[test]
    fn wildcard_covers_one_label() {
        let resolver = resolver(store_with_cert("*.example.test"));
        assert!(resolver.lookup("api.example.test").is_some());
        assert!(resolver.lookup("www.example.test").is_some());
        // Only the first label is folded into the wildcard.
        assert!(resolver.lookup("a.b.example.test").is_none());
        assert!(resolver.lookup("exampletest").is_none());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_certified_key(b"nope", b"nope").is_err());
        assert!(parse_certified_key(b"", b"").is_err());
    }

    #[test]
    fn parse_accepts_generated_material() {
        let generated = rcgen::generate_simple_self_signed(vec!["test.invalid".to_string()])
            .expect("generate cert");
        let key = parse_certified_key(
            generated.cert.pem().as_bytes(),
            generated.key_pair.serialize_pem().as_bytes(),
        )
        .expect("parse");
        assert_eq!(key.cert.len(), 1);
    }

    #[test]
    fn placeholder_generates_usable_material() {
        let placeholder = generate_placeholder().expect("placeholder");
        assert_eq!(placeholder.certified.cert.len(), 1);
    }
}
