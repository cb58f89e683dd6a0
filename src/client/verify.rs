//! TLS certificate verification backed by the TOFU store.

use std::sync::{Arc, Mutex};

use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{self, WebPkiSupportedAlgorithms};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{DigitallySignedStruct, Error as TlsError, OtherError, SignatureScheme};

use crate::tofu::HostsFile;

/// Verifier that replaces PKIX chain validation with the TOFU store, in the
/// spirit of the protocol: the fingerprint pin is the trust anchor.
/// Handshake signatures are still verified, so the peer must hold the key it
/// presents. Without a store every certificate is accepted.
#[derive(Debug)]
pub(crate) struct TofuVerifier {
    hosts: Option<Arc<HostsFile>>,
    server_addr: Mutex<String>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl TofuVerifier {
    pub(crate) fn new(hosts: Option<Arc<HostsFile>>) -> TofuVerifier {
        TofuVerifier {
            hosts,
            server_addr: Mutex::new(String::new()),
            algorithms: crypto::aws_lc_rs::default_provider().signature_verification_algorithms,
        }
    }

    /// Points the verifier at the `host:port` of the next hop.
    pub(crate) fn set_server_addr(&self, addr: &str) {
        *self.server_addr.lock().unwrap_or_else(|e| e.into_inner()) = addr.to_string();
    }
}

impl ServerCertVerifier for TofuVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        if let Some(hosts) = &self.hosts {
            let addr = self.server_addr.lock().unwrap_or_else(|e| e.into_inner()).clone();
            hosts
                .trust_certificate(end_entity, &addr)
                .map_err(|e| TlsError::Other(OtherError(Arc::new(e))))?;
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
