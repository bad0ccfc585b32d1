//! ilink host-side client core.
//!
//! Blocking engine for talking to a paired device through usbmuxd:
//!
//! - usbmuxd discovery and raw device channels (binary or plist dialect)
//! - Plist control channel with in-place TLS upgrade
//! - Lockdown pairing, sessions and service startup
//! - AFC file access with a shared handle table and chunked transfers

pub mod afc;
pub mod config;
pub mod device;
pub mod error;
pub mod lockdown;
pub mod mux;
pub mod plist_channel;
pub mod transport;

pub use afc::AfcClient;
pub use config::{AfcService, DiscoveryOptions, LockdownConfig, MuxAddress};
pub use device::Device;
pub use error::{ClientError, Result};
pub use lockdown::{EscrowBag, LockdownClient};
pub use mux::{Connector, MuxConnection, MuxConnector, MuxPairRecordStore, UsbMux};
pub use plist_channel::PlistChannel;
pub use transport::ServiceStream;
