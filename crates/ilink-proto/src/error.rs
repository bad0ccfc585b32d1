//! Error types for the ilink wire protocols.
//!
//! Protocol-level status codes (AFC status, mux result numbers) are carried
//! as data, see [`crate::afc::AfcStatus`]. This module defines the Rust-native
//! error type for failures inside this crate's boundaries.

use thiserror::Error;

/// Errors that can occur within the `ilink-proto` crate.
#[derive(Debug, Error)]
pub enum ProtoError {
    // --- Identity ---
    #[error("failed to generate RSA key: {0}")]
    KeyGeneration(String),

    #[error("invalid device public key: {0}")]
    InvalidPublicKey(String),

    #[error("failed to generate X.509 certificate: {0}")]
    CertificateGeneration(String),

    // --- TLS ---
    #[error("TLS configuration error: {0}")]
    TlsConfiguration(String),

    // --- Framing ---
    #[error("message too large: {0} bytes exceeds the frame limit")]
    MessageTooLarge(usize),

    #[error("truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    #[error("bad AFC magic: {0:02x?}")]
    BadMagic([u8; 8]),

    #[error("invalid packet length {0}")]
    InvalidLength(u64),

    #[error("unexpected mux message: {0}")]
    UnexpectedMessage(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("key/value list has an odd number of segments ({0})")]
    OddKeyValueCount(usize),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("invalid seek: {0}")]
    InvalidSeek(String),

    // --- Pairing records ---
    #[error("pairing record is missing {0}")]
    MissingField(&'static str),

    #[error("pairing record store {0} is read-only")]
    ReadOnlyStore(String),

    #[error("pairing record store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("pairing record store I/O: {0}")]
    StoreIo(#[from] std::io::Error),

    // --- Serialization ---
    #[error("plist error: {0}")]
    Plist(#[from] plist::Error),
}

/// Result type alias using [`ProtoError`].
pub type Result<T> = std::result::Result<T, ProtoError>;
