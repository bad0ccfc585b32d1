//! Pairing identity: RSA keys, the pairing certificate set, host and device
//! identifiers.

pub mod certificate;
pub mod host_id;
pub mod keypair;

pub use certificate::{DevicePublicKey, PairingCertificates};
pub use host_id::{device_identifier, local_host_id, normalize_udid};
pub use keypair::Keypair;
