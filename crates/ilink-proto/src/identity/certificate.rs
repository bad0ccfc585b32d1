//! Pairing certificate generation.
//!
//! Pairing needs three certificates, all RSA-2048 / SHA-256:
//!
//! - a self-signed root CA,
//! - a host certificate (fresh host key) signed by the root,
//! - a device certificate wrapping the device's own public key, signed by
//!   the root.
//!
//! The device keeps the device certificate and uses it for the TLS session;
//! the host keeps everything in its pairing record.

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, IsCa, KeyPair as RcgenKeyPair,
    KeyUsagePurpose, PublicKeyData, SerialNumber, SignatureAlgorithm, PKCS_RSA_SHA256,
};
use rsa::RsaPublicKey;
use rustls_pki_types::PrivatePkcs8KeyDer;
use time::OffsetDateTime;

use crate::error::{ProtoError, Result};
use crate::identity::keypair::{self, Keypair};

/// Validity of every generated certificate, in days.
const VALIDITY_DAYS: i64 = 10 * 365;

/// The certificate set produced for one pairing.
#[derive(Clone)]
pub struct PairingCertificates {
    pub root_certificate_pem: String,
    pub root_private_key_pem: String,
    pub host_certificate_pem: String,
    pub host_private_key_pem: String,
    pub device_certificate_pem: String,
}

impl std::fmt::Debug for PairingCertificates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingCertificates").finish_non_exhaustive()
    }
}

impl PairingCertificates {
    /// Generate root, host and device certificates for a device whose public
    /// key is `device_public_key_pem`. Validity starts at `now_epoch_secs`.
    pub fn generate(device_public_key_pem: &[u8], now_epoch_secs: i64) -> Result<Self> {
        let device_key = DevicePublicKey::from_pem(device_public_key_pem)?;
        let (not_before, not_after) = validity(now_epoch_secs)?;

        let root_key = Keypair::generate()?;
        let root_signer = rcgen_keypair(&root_key)?;
        let mut root_params = base_params(not_before, not_after, 0)?;
        root_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        root_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let root_cert = root_params.self_signed(&root_signer).map_err(cert_err)?;

        let host_key = Keypair::generate()?;
        let host_signer = rcgen_keypair(&host_key)?;
        let host_cert = leaf_params(not_before, not_after, 1)?
            .signed_by(&host_signer, &root_cert, &root_signer)
            .map_err(cert_err)?;

        let device_cert = leaf_params(not_before, not_after, 2)?
            .signed_by(&device_key, &root_cert, &root_signer)
            .map_err(cert_err)?;

        Ok(Self {
            root_certificate_pem: root_cert.pem(),
            root_private_key_pem: root_key.to_pkcs8_pem()?,
            host_certificate_pem: host_cert.pem(),
            host_private_key_pem: host_key.to_pkcs8_pem()?,
            device_certificate_pem: device_cert.pem(),
        })
    }
}

/// A device public key presented to `rcgen` as the subject key of the device
/// certificate. Only the public half exists on the host.
pub struct DevicePublicKey {
    pkcs1_der: Vec<u8>,
}

impl DevicePublicKey {
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        Self::from_key(&keypair::parse_public_key_pem(pem)?)
    }

    pub fn from_key(key: &RsaPublicKey) -> Result<Self> {
        Ok(Self {
            pkcs1_der: keypair::public_key_pkcs1_der(key)?,
        })
    }
}

impl PublicKeyData for DevicePublicKey {
    fn der_bytes(&self) -> &[u8] {
        &self.pkcs1_der
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        &PKCS_RSA_SHA256
    }
}

fn rcgen_keypair(key: &Keypair) -> Result<RcgenKeyPair> {
    let pkcs8 = PrivatePkcs8KeyDer::from(key.to_pkcs8_der()?);
    RcgenKeyPair::from_pkcs8_der_and_sign_algo(&pkcs8, &PKCS_RSA_SHA256).map_err(cert_err)
}

fn validity(now_epoch_secs: i64) -> Result<(OffsetDateTime, OffsetDateTime)> {
    let not_before = OffsetDateTime::from_unix_timestamp(now_epoch_secs)
        .map_err(|e| ProtoError::CertificateGeneration(format!("invalid not_before: {e}")))?;
    let not_after = OffsetDateTime::from_unix_timestamp(now_epoch_secs + VALIDITY_DAYS * 86400)
        .map_err(|e| ProtoError::CertificateGeneration(format!("invalid not_after: {e}")))?;
    Ok((not_before, not_after))
}

fn base_params(not_before: OffsetDateTime, not_after: OffsetDateTime, serial: u64) -> Result<CertificateParams> {
    let mut params = CertificateParams::new(vec![])
        .map_err(|e| ProtoError::CertificateGeneration(format!("invalid cert params: {e}")))?;
    params.not_before = not_before;
    params.not_after = not_after;
    params.serial_number = Some(SerialNumber::from(serial));
    params.distinguished_name = DistinguishedName::new();
    Ok(params)
}

fn leaf_params(not_before: OffsetDateTime, not_after: OffsetDateTime, serial: u64) -> Result<CertificateParams> {
    let mut params = base_params(not_before, not_after, serial)?;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    Ok(params)
}

fn cert_err(e: rcgen::Error) -> ProtoError {
    ProtoError::CertificateGeneration(e.to_string())
}
