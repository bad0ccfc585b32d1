//! ilink wire protocol definitions.
//!
//! Shared protocol layer used by `ilink-client-core`:
//!
//! - usbmux control packets (binary and plist sub-protocols)
//! - Length-prefixed plist framing for lockdown and plist services
//! - AFC packet headers, opcodes, status codes and reply decoders
//! - Pairing records, pairing-record stores and the pairing PKI
//! - TLS configuration for the in-place session upgrade
//!
//! Everything here is synchronous and works on byte slices. Sockets live in
//! the client crate.

pub mod afc;
pub mod codec;
pub mod error;
pub mod identity;
pub mod mux;
pub mod pair_record;
pub mod store;
pub mod tls;
pub mod version;
