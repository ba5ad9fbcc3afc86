//! Per-origin pooled HTTP transports
//! One connection-pooling client is shared by every mapping that targets the same origin

use crate::mapping::PathMapping;
use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Pooled HTTP/1.1 client used to reach a single origin
pub type HttpClient = Client<HttpsConnector<HttpConnector>, BoxBody<Bytes, hyper::Error>>;

/// Transport options shared by every pooled client
#[derive(Debug, Clone, Copy)]
pub struct TransportOptions {
    /// Accept any upstream certificate, including self-signed and expired ones.
    /// Only meant for a local development proxy talking to local backends.
    pub insecure_skip_verify: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            insecure_skip_verify: true,
        }
    }
}

/// A pooled client bound to one origin
pub struct Transport {
    origin: String,
    client: HttpClient,
}

impl Transport {
    /// Origin key this transport serves
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// The underlying pooled client
    pub fn client(&self) -> &HttpClient {
        &self.client
    }
}

/// Origin-keyed set of transports
///
/// Entries are created while the mapping table is built and live for the
/// rest of the process.
pub struct TransportPool {
    options: TransportOptions,
    tls_config: ClientConfig,
    transports: HashMap<String, Arc<Transport>>,
}

impl TransportPool {
    /// Create an empty pool
    pub fn new(options: TransportOptions) -> Self {
        let tls_config = if options.insecure_skip_verify {
            warn!("TLS certificate verification DISABLED for upstream backends (development only)");
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        Self {
            options,
            tls_config,
            transports: HashMap::new(),
        }
    }

    /// Options this pool was built with
    pub fn options(&self) -> TransportOptions {
        self.options
    }

    /// Return the transport for the mapping's origin, creating it on first use
    pub fn get_or_create(&mut self, mapping: &PathMapping) -> Arc<Transport> {
        let origin = mapping.origin();

        if let Some(transport) = self.transports.get(&origin) {
            return transport.clone();
        }

        debug!("Creating transport for origin {}", origin);

        let transport = Arc::new(Transport {
            origin: origin.clone(),
            client: self.build_client(),
        });

        self.transports.insert(origin, transport.clone());
        transport
    }

    /// Look up an existing transport by origin key
    pub fn get(&self, origin: &str) -> Option<&Arc<Transport>> {
        self.transports.get(origin)
    }

    /// Number of distinct origins
    pub fn len(&self) -> usize {
        self.transports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    fn build_client(&self) -> HttpClient {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(self.tls_config.clone())
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        Client::builder(TokioExecutor::new()).build(connector)
    }
}

/// Certificate verifier that accepts every upstream certificate
#[derive(Debug)]
pub struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(rule: &str) -> PathMapping {
        PathMapping::parse(rule).unwrap()
    }

    #[test]
    fn test_same_origin_shares_transport() {
        let mut pool = TransportPool::new(TransportOptions::default());

        let a = pool.get_or_create(&mapping("/a = http://shared.test/a"));
        let b = pool.get_or_create(&mapping("/b = http://shared.test/b"));

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
        assert_eq!(a.origin(), "http://shared.test");
    }

    #[test]
    fn test_distinct_origins_get_distinct_transports() {
        let mut pool = TransportPool::new(TransportOptions::default());

        let plain = pool.get_or_create(&mapping("/a = http://shared.test/"));
        let tls = pool.get_or_create(&mapping("/b = https://shared.test/"));
        let port = pool.get_or_create(&mapping("/c = http://shared.test:8080/"));
        let user = pool.get_or_create(&mapping("/d = http://me@shared.test/"));

        assert!(!Arc::ptr_eq(&plain, &tls));
        assert!(!Arc::ptr_eq(&plain, &port));
        assert!(!Arc::ptr_eq(&plain, &user));
        assert_eq!(pool.len(), 4);
        assert!(pool.get("http://me@shared.test").is_some());
    }

    #[test]
    fn test_verified_pool() {
        let pool = TransportPool::new(TransportOptions {
            insecure_skip_verify: false,
        });
        assert!(!pool.options().insecure_skip_verify);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_no_verifier_supported_schemes() {
        let schemes = NoVerifier.supported_verify_schemes();
        assert!(schemes.contains(&SignatureScheme::ECDSA_NISTP256_SHA256));
        assert!(schemes.contains(&SignatureScheme::RSA_PSS_SHA256));
    }
}
