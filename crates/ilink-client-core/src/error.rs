//! Error types for the host-side client.
//!
//! Transport failures, pairing/session failures and per-call AFC failures
//! share one enum so callers can match on the condition rather than the
//! layer. [`ClientError::requires_user_action`] separates the errors that need
//! someone to touch the device from those worth retrying.

use std::io;

use ilink_proto::afc::AfcStatus;
use ilink_proto::error::ProtoError;
use thiserror::Error;

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    // --- Transport ---
    #[error("connection broken")]
    ConnectionBroken,

    #[error("usbmux protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("usbmux reply tag {actual} does not match request tag {expected}")]
    TagMismatch { expected: u32, actual: u32 },

    #[error("usbmux error: {0}")]
    Mux(String),

    #[error("device not found{}", .0.as_deref().map(|s| format!(": {s}")).unwrap_or_default())]
    DeviceNotFound(Option<String>),

    // --- Lockdown / pairing ---
    #[error("lockdown initialization failed: {0}")]
    Initialization(String),

    #[error("pairing failed: {0}")]
    Pairing(String),

    #[error("device does not trust this host; accept the trust prompt on the device")]
    NotTrusted,

    #[error("pairing succeeded but the new record could not be validated: {0}")]
    FatalPairing(String),

    #[error("no session: device is not paired")]
    NotPaired,

    #[error("could not stop session: {0}")]
    CannotStopSession(String),

    #[error("could not start service {service}: {reason}")]
    StartService { service: String, reason: String },

    #[error("service {service} requires the device to be unlocked")]
    ServicePasswordProtected { service: String },

    #[error("lockdown {request} failed: {error}")]
    Lockdown { request: &'static str, error: String },

    // --- AFC ---
    #[error("{operation} failed with {status}{context}")]
    Afc {
        operation: &'static str,
        status: AfcStatus,
        context: String,
    },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("unknown file handle {0}")]
    UnknownHandle(u64),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // --- Plumbing ---
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("channel is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtoError),
}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::WriteZero => Self::ConnectionBroken,
            _ => Self::Io(e),
        }
    }
}

impl ClientError {
    /// The channel this error came from is no longer usable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectionBroken
                | Self::VersionMismatch { .. }
                | Self::TagMismatch { .. }
                | Self::Closed
                | Self::Io(_)
                | Self::Tls(_)
        )
    }

    /// Retrying will not help until someone acts on the device itself.
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            Self::NotTrusted | Self::ServicePasswordProtected { .. }
        )
    }

    /// Build an AFC error; `path` becomes the context suffix when known.
    pub(crate) fn afc(operation: &'static str, status: AfcStatus, path: Option<&str>) -> Self {
        Self::Afc {
            operation,
            status,
            context: path.map(|p| format!(" ({p})")).unwrap_or_default(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
