//! Client configuration.
//!
//! Everything here has a working default; tests and embedders override the
//! pieces they care about (daemon address, store list, cache directory).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ilink_proto::identity::local_host_id;
use ilink_proto::mux::{DEFAULT_SOCKET_PATH, DEFAULT_TCP_PORT};
use ilink_proto::store::{DirectoryStore, PairRecordStore};

use crate::mux::MuxPairRecordStore;

/// Environment variable overriding the daemon address: `UNIX:/path` or
/// `host:port`.
pub const SOCKET_ADDRESS_ENV: &str = "USBMUXD_SOCKET_ADDRESS";

/// Lockdown's well-known device port.
pub const LOCKDOWN_PORT: u16 = 62078;

/// Where the usbmuxd daemon listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxAddress {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl MuxAddress {
    /// Platform default: the Unix socket where available, loopback TCP
    /// elsewhere.
    pub fn platform_default() -> Self {
        if cfg!(unix) {
            Self::Unix(PathBuf::from(DEFAULT_SOCKET_PATH))
        } else {
            Self::Tcp(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::LOCALHOST,
                DEFAULT_TCP_PORT,
            )))
        }
    }

    /// Honour [`SOCKET_ADDRESS_ENV`], falling back to the platform default.
    pub fn from_env() -> Self {
        std::env::var(SOCKET_ADDRESS_ENV)
            .ok()
            .and_then(|v| Self::parse(&v))
            .unwrap_or_else(Self::platform_default)
    }

    /// Parse `UNIX:/path` or `host:port`. `None` when neither form fits.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if let Some(path) = value.strip_prefix("UNIX:") {
            return (!path.is_empty()).then(|| Self::Unix(PathBuf::from(path)));
        }
        value.parse().ok().map(Self::Tcp)
    }
}

impl Default for MuxAddress {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Device discovery settings.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Pick the device with this serial (UDID). `None` takes the first one.
    pub serial: Option<String>,
    /// Wait per discovery poll.
    pub poll_timeout: Duration,
    /// Polls before giving up.
    pub max_attempts: u32,
    pub address: MuxAddress,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            serial: None,
            poll_timeout: Duration::from_millis(100),
            max_attempts: 5,
            address: MuxAddress::from_env(),
        }
    }
}

impl DiscoveryOptions {
    pub fn with_serial(serial: impl Into<String>) -> Self {
        Self {
            serial: Some(serial.into()),
            ..Self::default()
        }
    }
}

/// Lockdown session settings.
#[derive(Clone)]
pub struct LockdownConfig {
    /// `Label` sent with every request.
    pub label: String,
    pub port: u16,
    /// Host id used when generating a new pairing record.
    pub host_id: String,
    /// Require the device's TLS certificate to equal the one in the record.
    pub pin_device_certificate: bool,
    /// Lookup order for existing pairing records; first hit wins.
    pub sources: Vec<Arc<dyn PairRecordStore>>,
    /// Where newly created records are saved.
    pub cache: Arc<dyn PairRecordStore>,
}

impl std::fmt::Debug for LockdownConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockdownConfig")
            .field("label", &self.label)
            .field("port", &self.port)
            .field("host_id", &self.host_id)
            .field("pin_device_certificate", &self.pin_device_certificate)
            .field("sources", &self.sources)
            .field("cache", &self.cache)
            .finish()
    }
}

impl LockdownConfig {
    /// Default sources (system directory, usbmuxd, application cache) with
    /// the daemon reached at `address`.
    pub fn with_address(address: MuxAddress) -> Self {
        let cache: Arc<dyn PairRecordStore> = Arc::new(DirectoryStore::cache(default_cache_dir()));
        Self {
            label: "ilink".to_owned(),
            port: LOCKDOWN_PORT,
            host_id: local_host_id(),
            pin_device_certificate: false,
            sources: vec![
                Arc::new(DirectoryStore::system()),
                Arc::new(MuxPairRecordStore::new(address)),
                Arc::clone(&cache),
            ],
            cache,
        }
    }

    /// Only `store`, used both for lookup and for saving.
    pub fn with_store(store: Arc<dyn PairRecordStore>) -> Self {
        Self {
            label: "ilink".to_owned(),
            port: LOCKDOWN_PORT,
            host_id: local_host_id(),
            pin_device_certificate: false,
            sources: vec![Arc::clone(&store)],
            cache: store,
        }
    }
}

impl Default for LockdownConfig {
    fn default() -> Self {
        Self::with_address(MuxAddress::from_env())
    }
}

/// Application cache for pairing records.
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("ilink").join("lockdown"))
        .unwrap_or_else(|| PathBuf::from(".cache").join("ilink"))
}

/// Which AFC service to start. Both speak the same protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AfcService {
    /// Media partition.
    #[default]
    Standard,
    /// Whole filesystem; only present on jailbroken devices.
    Elevated,
}

impl AfcService {
    pub fn service_name(self) -> &'static str {
        match self {
            Self::Standard => "com.apple.afc",
            Self::Elevated => "com.apple.afc2",
        }
    }
}
