//! RSA keypairs for the pairing PKI.
//!
//! Key generation and encoding are delegated to the `rsa` crate. This module
//! is a thin wrapper providing the encodings the rest of `ilink-proto` needs:
//! PKCS#8 DER for `rcgen`, PEM for pairing records.

use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey, LineEnding};
use rsa::pkcs8::{DecodePublicKey, EncodePrivateKey};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::error::{ProtoError, Result};

/// Modulus size used for every key in the pairing PKI.
pub const KEY_BITS: usize = 2048;

/// An RSA private key. The inner key is zeroized on drop by `rsa`.
pub struct Keypair {
    private_key: RsaPrivateKey,
}

impl Keypair {
    /// Generate a new 2048-bit key using the OS CSPRNG.
    pub fn generate() -> Result<Self> {
        let private_key = RsaPrivateKey::new(&mut OsRng, KEY_BITS)
            .map_err(|e| ProtoError::KeyGeneration(e.to_string()))?;
        Ok(Self { private_key })
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.private_key.to_public_key()
    }

    /// PKCS#8 DER, the form `rcgen` signs with.
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>> {
        let doc = self
            .private_key
            .to_pkcs8_der()
            .map_err(|e| ProtoError::KeyGeneration(e.to_string()))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// PKCS#8 PEM, the form stored as `HostPrivateKey` / `RootPrivateKey`.
    pub fn to_pkcs8_pem(&self) -> Result<String> {
        let pem = self
            .private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| ProtoError::KeyGeneration(e.to_string()))?;
        Ok(pem.to_string())
    }
}

/// Parse a device public key. Devices send PKCS#1 (`RSA PUBLIC KEY`) PEM;
/// SubjectPublicKeyInfo (`PUBLIC KEY`) PEM is accepted too.
pub fn parse_public_key_pem(pem: &[u8]) -> Result<RsaPublicKey> {
    let text = std::str::from_utf8(pem)
        .map_err(|_| ProtoError::InvalidPublicKey("public key is not UTF-8 PEM".into()))?;
    RsaPublicKey::from_pkcs1_pem(text)
        .or_else(|_| RsaPublicKey::from_public_key_pem(text))
        .map_err(|e| ProtoError::InvalidPublicKey(e.to_string()))
}

/// PKCS#1 `RSAPublicKey` DER, the bit-string contents of a certificate's
/// subjectPublicKeyInfo.
pub fn public_key_pkcs1_der(key: &RsaPublicKey) -> Result<Vec<u8>> {
    let doc = key
        .to_pkcs1_der()
        .map_err(|e| ProtoError::InvalidPublicKey(e.to_string()))?;
    Ok(doc.as_bytes().to_vec())
}

/// PKCS#1 PEM encoding of a public key, as devices report it.
pub fn public_key_pkcs1_pem(key: &RsaPublicKey) -> Result<String> {
    key.to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| ProtoError::InvalidPublicKey(e.to_string()))
}
