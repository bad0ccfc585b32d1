//! TLS client configuration for device channels.
//!
//! The builder enforces:
//! - TLS 1.2 or 1.3
//! - Ring crypto provider
//! - Client authentication with the host certificate and key
//! - [`DeviceCertVerifier`] in place of WebPKI chain validation

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::ServerCertVerifier;
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};

use crate::error::{ProtoError, Result};
use crate::tls::verifier::DeviceCertVerifier;

/// Build a `rustls::ClientConfig` from a PEM file holding the host
/// certificate followed by the host private key.
///
/// When `pinned_device_cert_pem` is given, the device must present exactly
/// that certificate.
pub fn build_device_tls_config(
    identity_pem_path: &Path,
    pinned_device_cert_pem: Option<&[u8]>,
) -> Result<rustls::ClientConfig> {
    let cert_chain = CertificateDer::pem_file_iter(identity_pem_path)
        .map_err(|e| ProtoError::TlsConfiguration(format!("reading host certificate: {e}")))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ProtoError::TlsConfiguration(format!("parsing host certificate: {e}")))?;
    if cert_chain.is_empty() {
        return Err(ProtoError::TlsConfiguration(
            "identity file holds no certificate".into(),
        ));
    }

    let private_key = PrivateKeyDer::from_pem_file(identity_pem_path)
        .map_err(|e| ProtoError::TlsConfiguration(format!("host private key: {e}")))?;

    let pinned = pinned_device_cert_pem
        .map(|pem| {
            CertificateDer::from_pem_slice(pem)
                .map_err(|e| ProtoError::TlsConfiguration(format!("device certificate: {e}")))
        })
        .transpose()?;

    let verifier: Arc<dyn ServerCertVerifier> = Arc::new(DeviceCertVerifier::new(pinned));

    rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .map_err(|e| ProtoError::TlsConfiguration(format!("TLS version config: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(cert_chain, private_key)
        .map_err(|e| ProtoError::TlsConfiguration(format!("client cert config: {e}")))
}

/// Server name handed to rustls. An IP address keeps SNI out of the
/// ClientHello; devices do not expect one.
pub fn device_server_name() -> ServerName<'static> {
    ServerName::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST).into())
}
