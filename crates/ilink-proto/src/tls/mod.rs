//! TLS for the in-place session upgrade.
//!
//! Lockdown and service channels start in plaintext and may be upgraded to
//! TLS on the same socket. The host authenticates with the host certificate
//! and key from its pairing record; the device presents the certificate the
//! host issued it at pairing time.
//!
//! - Custom rustls verifier for the device certificate
//! - Client config builder loading the transient PEM identity file

pub mod config;
pub mod verifier;

pub use config::{build_device_tls_config, device_server_name};
pub use verifier::DeviceCertVerifier;
