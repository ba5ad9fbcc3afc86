//! Ephemeral certificate generation for local TLS termination
//! A single self-signed CA certificate is generated in memory at startup

use chrono::{DateTime, Months, SubsecRound, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tracing::info;

pub const ORGANIZATION: &str = "devproxy";
pub const ORGANIZATIONAL_UNIT: &str = "development reverse proxy";
pub const COMMON_NAME: &str = "devproxy";

/// Validity period in calendar months
const VALIDITY_MONTHS: u32 = 3;

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("failed to generate key pair: {0}")]
    KeyGeneration(rcgen::Error),

    #[error("failed to generate serial number: {0}")]
    Serial(rand::Error),

    #[error("invalid validity window: {0}")]
    Validity(String),

    #[error("failed to build certificate: {0}")]
    Construction(rcgen::Error),

    #[error("failed to build TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// In-memory self-signed CA certificate and its private key
pub struct GeneratedCertificate {
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    key_der: Vec<u8>,
    serial: [u8; 16],
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
}

/// Generate a self-signed P-256 CA certificate valid for three months
pub fn generate() -> Result<GeneratedCertificate, CertificateError> {
    let key_pair =
        KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(CertificateError::KeyGeneration)?;

    let mut serial = [0u8; 16];
    OsRng
        .try_fill_bytes(&mut serial)
        .map_err(CertificateError::Serial)?;

    let not_before = Utc::now().trunc_subsecs(0);
    let not_after = validity_end(not_before)?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn.push(DnType::OrganizationalUnitName, ORGANIZATIONAL_UNIT);
    dn.push(DnType::CommonName, COMMON_NAME);

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.serial_number = Some(SerialNumber::from_slice(&serial));
    params.not_before = to_offset_date_time(not_before)?;
    params.not_after = to_offset_date_time(not_after)?;
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));

    let cert = params
        .self_signed(&key_pair)
        .map_err(CertificateError::Construction)?;

    info!(
        "Generated self-signed certificate, valid {} to {}",
        not_before, not_after
    );

    Ok(GeneratedCertificate {
        cert_der: cert.der().clone(),
        cert_pem: cert.pem(),
        key_der: key_pair.serialize_der(),
        serial,
        not_before,
        not_after,
    })
}

/// End of the validity window, clamped to the last day of a shorter month
fn validity_end(not_before: DateTime<Utc>) -> Result<DateTime<Utc>, CertificateError> {
    not_before
        .checked_add_months(Months::new(VALIDITY_MONTHS))
        .ok_or_else(|| {
            CertificateError::Validity(format!("{} + {} months", not_before, VALIDITY_MONTHS))
        })
}

fn to_offset_date_time(dt: DateTime<Utc>) -> Result<time::OffsetDateTime, CertificateError> {
    time::OffsetDateTime::from_unix_timestamp(dt.timestamp())
        .map_err(|e| CertificateError::Validity(e.to_string()))
}

impl GeneratedCertificate {
    /// DER-encoded certificate
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// PEM-encoded certificate, for clients that want to trust it
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Big-endian serial number bytes
    pub fn serial(&self) -> &[u8; 16] {
        &self.serial
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// TLS 1.3-only server configuration presenting this certificate
    pub fn server_config(&self) -> Result<ServerConfig, CertificateError> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()));

        let mut config = ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
            .with_no_client_auth()
            .with_single_cert(vec![self.cert_der.clone()], key)?;

        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(config)
    }

    pub fn tls_acceptor(&self) -> Result<TlsAcceptor, CertificateError> {
        Ok(TlsAcceptor::from(Arc::new(self.server_config()?)))
    }
}
