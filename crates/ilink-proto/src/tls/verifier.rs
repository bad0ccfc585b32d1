//! Device certificate verification.
//!
//! The device certificate is issued by the host's own pairing root, so there
//! is no chain to a public trust anchor. [`DeviceCertVerifier`] accepts the
//! presented certificate, or, when pinned, only the exact certificate stored
//! in the pairing record. Handshake signatures are still checked through the
//! ring provider.

use std::sync::LazyLock;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{DigitallySignedStruct, Error as TlsError, SignatureScheme};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};
use tracing::debug;

/// Get the ring provider's supported signature verification algorithms.
fn ring_signature_algorithms() -> &'static rustls::crypto::WebPkiSupportedAlgorithms {
    static ALGORITHMS: LazyLock<rustls::crypto::WebPkiSupportedAlgorithms> =
        LazyLock::new(|| rustls::crypto::ring::default_provider().signature_verification_algorithms);
    &ALGORITHMS
}

#[derive(Debug)]
pub struct DeviceCertVerifier {
    pinned: Option<CertificateDer<'static>>,
}

impl DeviceCertVerifier {
    pub fn new(pinned: Option<CertificateDer<'static>>) -> Self {
        Self { pinned }
    }

    fn check(&self, end_entity: &CertificateDer<'_>) -> Result<(), TlsError> {
        if end_entity.is_empty() {
            return Err(TlsError::General("device presented an empty certificate".into()));
        }
        match &self.pinned {
            Some(pinned) if pinned.as_ref() != end_entity.as_ref() => Err(TlsError::General(
                "device certificate does not match the pairing record".into(),
            )),
            Some(_) => {
                debug!("device certificate matches pairing record");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl ServerCertVerifier for DeviceCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        self.check(end_entity)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, ring_signature_algorithms())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, ring_signature_algorithms())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring_signature_algorithms().supported_schemes()
    }
}
