//! Pairing-record stores.
//!
//! A [`PairRecordStore`] looks records up by device identifier. Lockdown
//! consults an ordered list of stores and takes the first hit:
//!
//! 1. the system store written by the platform's own sync service
//!    (read-only, [`DirectoryStore::system`]),
//! 2. the usbmuxd daemon's record store (lives in the client crate, it needs
//!    a socket),
//! 3. the application cache ([`DirectoryStore::cache`]), the only store new
//!    records are written to.
//!
//! [`MemoryPairStore`] backs tests and short-lived processes.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{ProtoError, Result};
use crate::pair_record::PairRecord;

/// Lookup (and optionally persistence) of pairing records by device
/// identifier.
///
/// Implementations must be `Send + Sync` so an ordered list can be shared as
/// `Arc<dyn PairRecordStore>` between device handles.
pub trait PairRecordStore: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// `Ok(None)` when the store has no record for `identifier`.
    fn load(&self, identifier: &str) -> Result<Option<PairRecord>>;

    /// Persist `record`. Read-only stores keep the default.
    fn save(&self, _identifier: &str, _record: &PairRecord) -> Result<()> {
        Err(ProtoError::ReadOnlyStore(self.name().to_owned()))
    }
}

impl std::fmt::Debug for dyn PairRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PairRecordStore({})", self.name())
    }
}

/// A directory of `<identifier>.plist` files.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    name: &'static str,
    dir: PathBuf,
    writable: bool,
}

impl DirectoryStore {
    /// The platform's system-wide pairing-record directory, read-only.
    pub fn system() -> Self {
        Self::system_at(default_system_dir())
    }

    /// A read-only store rooted somewhere other than the platform default.
    pub fn system_at(dir: impl Into<PathBuf>) -> Self {
        Self {
            name: "system",
            dir: dir.into(),
            writable: false,
        }
    }

    /// A writable application cache rooted at `dir`. The directory is created
    /// on first save.
    pub fn cache(dir: impl Into<PathBuf>) -> Self {
        Self {
            name: "cache",
            dir: dir.into(),
            writable: true,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, identifier: &str) -> PathBuf {
        self.dir.join(format!("{identifier}.plist"))
    }
}

impl PairRecordStore for DirectoryStore {
    fn name(&self) -> &str {
        self.name
    }

    fn load(&self, identifier: &str) -> Result<Option<PairRecord>> {
        let path = self.record_path(identifier);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        debug!(store = self.name, path = %path.display(), "loaded pairing record");
        PairRecord::from_plist_bytes(&bytes).map(Some)
    }

    fn save(&self, identifier: &str, record: &PairRecord) -> Result<()> {
        if !self.writable {
            return Err(ProtoError::ReadOnlyStore(self.name.to_owned()));
        }
        fs::create_dir_all(&self.dir)?;

        // Write-then-rename so a crash never leaves a half-written record.
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&record.to_plist_bytes()?)?;
        tmp.flush()?;
        let path = self.record_path(identifier);
        tmp.persist(&path).map_err(|e| ProtoError::StoreIo(e.error))?;

        debug!(store = self.name, path = %path.display(), "saved pairing record");
        Ok(())
    }
}

#[cfg(windows)]
fn default_system_dir() -> PathBuf {
    let base = std::env::var_os("ALLUSERSPROFILE").unwrap_or_else(|| "C:\\ProgramData".into());
    PathBuf::from(base).join("Apple").join("Lockdown")
}

#[cfg(not(windows))]
fn default_system_dir() -> PathBuf {
    PathBuf::from("/var/db/lockdown")
}

/// In-memory store backed by `RwLock<HashMap<..>>`.
#[derive(Default)]
pub struct MemoryPairStore {
    records: RwLock<HashMap<String, PairRecord>>,
}

impl MemoryPairStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(identifier: &str, record: PairRecord) -> Self {
        let store = Self::new();
        store
            .records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(identifier.to_owned(), record);
        store
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PairRecordStore for MemoryPairStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn load(&self, identifier: &str) -> Result<Option<PairRecord>> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(identifier)
            .cloned())
    }

    fn save(&self, identifier: &str, record: &PairRecord) -> Result<()> {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(identifier.to_owned(), record.clone());
        Ok(())
    }
}
