//! TLS certificate material: self-signed identities, PEM storage, SPKI
//! fingerprints and the server-side TLS configuration.

use std::fs;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use sha2::{Digest, Sha256};
use thiserror::Error;
use ::time::{Duration, OffsetDateTime};
use tokio_rustls::rustls::client::danger::HandshakeSignatureValid;
use tokio_rustls::rustls::crypto::{self, WebPkiSupportedAlgorithms};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, UnixTime};
use tokio_rustls::rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use tokio_rustls::rustls::{self, DigitallySignedStruct, ServerConfig, SignatureScheme};
use x509_parser::prelude::*;

/// Errors from certificate handling.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate generation failed: {source}")]
    Generate {
        #[from]
        source: rcgen::Error,
    },

    #[error("malformed certificate: {reason}")]
    Parse { reason: String },

    #[error("no certificate found in {path}")]
    NoCertificate { path: String },

    #[error("no pkcs8 private key found in {path}")]
    NoPrivateKey { path: String },

    #[error("tls configuration failed: {source}")]
    Tls {
        #[from]
        source: rustls::Error,
    },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// A certificate and its private key, in DER and PEM form.
pub struct Identity {
    cert_der: CertificateDer<'static>,
    key_der: PrivatePkcs8KeyDer<'static>,
    cert_pem: String,
    key_pem: String,
}

impl Identity {
    /// Creates a self-signed identity valid for the given hostnames, with
    /// the first hostname as the subject common name.
    ///
    /// `valid_days` may be negative to produce an already expired
    /// certificate, which is useful for exercising renewal flows.
    pub fn self_signed(hostnames: &[&str], valid_days: i64) -> Result<Identity, CertError> {
        Identity::self_signed_with_cn(hostnames.first().copied().unwrap_or(""), hostnames, valid_days)
    }

    /// Creates a self-signed identity with an explicit common name. An empty
    /// `hostnames` slice yields a certificate without subject alternative
    /// names, carrying only the legacy common name.
    pub fn self_signed_with_cn(
        common_name: &str,
        hostnames: &[&str],
        valid_days: i64,
    ) -> Result<Identity, CertError> {
        let san: Vec<String> = hostnames.iter().map(|h| h.to_string()).collect();
        let mut params = CertificateParams::new(san)?;

        let mut dn = DistinguishedName::new();
        if !common_name.is_empty() {
            dn.push(DnType::CommonName, common_name);
        }
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now + Duration::days(valid_days.min(0) * 2);
        params.not_after = now + Duration::days(valid_days);

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;

        Ok(Identity {
            cert_der: cert.der().clone(),
            key_der: PrivatePkcs8KeyDer::from(key.serialize_der()),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    /// Reads a PEM encoded certificate/key pair from disk.
    pub fn load(
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
    ) -> Result<Identity, CertError> {
        let cert_pem = fs::read_to_string(&cert_file)?;
        let key_pem = fs::read_to_string(&key_file)?;

        let mut reader = BufReader::new(cert_pem.as_bytes());
        let cert_der = rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .next()
            .ok_or_else(|| CertError::NoCertificate {
                path: cert_file.as_ref().display().to_string(),
            })?;

        let mut reader = BufReader::new(key_pem.as_bytes());
        let key_der = rustls_pemfile::pkcs8_private_keys(&mut reader)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .next()
            .ok_or_else(|| CertError::NoPrivateKey {
                path: key_file.as_ref().display().to_string(),
            })?;

        Ok(Identity { cert_der, key_der, cert_pem, key_pem })
    }

    /// Stores the identity as a PEM encoded certificate/key pair.
    pub fn store(
        &self,
        cert_file: impl AsRef<Path>,
        key_file: impl AsRef<Path>,
    ) -> io::Result<()> {
        fs::write(cert_file, &self.cert_pem)?;
        fs::write(key_file, &self.key_pem)
    }

    /// The certificate in DER form.
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// A copy of the private key in DER form.
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key_der.clone_key())
    }

    /// The certificate in PEM form.
    pub fn certificate_pem(&self) -> &str {
        &self.cert_pem
    }

    /// The private key in PEM form.
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }
}

/// Returns the hex encoded SHA-256 hash of the certificate's Subject Public
/// Key Info section. The fingerprint is stable across re-issuance with the
/// same key.
pub fn fingerprint(cert: &CertificateDer<'_>) -> Result<String, CertError> {
    let (_, parsed) = X509Certificate::from_der(cert)
        .map_err(|e| CertError::Parse { reason: e.to_string() })?;
    Ok(hex_sha256(parsed.tbs_certificate.subject_pki.raw))
}

pub(crate) fn hex_sha256(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

/// Builds a server TLS configuration that presents `identity` and requests,
/// but does not require, a client certificate. Client identity decisions
/// happen at the application layer, keyed on the certificate the handler
/// receives.
pub fn server_config(identity: &Identity) -> Result<Arc<ServerConfig>, CertError> {
    let config = ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(OfferedClientAuth::new()))
        .with_single_cert(vec![identity.certificate().clone()], identity.private_key())?;
    Ok(Arc::new(config))
}

/// Accepts any client certificate without requiring one.
#[derive(Debug)]
struct OfferedClientAuth {
    algorithms: WebPkiSupportedAlgorithms,
}

impl OfferedClientAuth {
    fn new() -> OfferedClientAuth {
        OfferedClientAuth {
            algorithms: crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for OfferedClientAuth {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
