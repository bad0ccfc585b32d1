//! Device OS version handling.
//!
//! Lockdown behaviour changes with the device's `ProductVersion`: devices
//! older than 11.0 expect an explicit `ValidatePair` before `StartSession`.

use std::fmt;
use std::str::FromStr;

use crate::error::ProtoError;

/// First OS version that no longer needs `ValidatePair`.
pub const VALIDATE_PAIR_CUTOFF: ProductVersion = ProductVersion::new(11, 0, 0);

/// A dotted `major[.minor[.patch]]` version as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProductVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ProductVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Whether lockdown must send `ValidatePair` to this device.
    pub fn needs_validate_pair(self) -> bool {
        self < VALIDATE_PAIR_CUTOFF
    }
}

impl FromStr for ProductVersion {
    type Err = ProtoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let mut next = |required: bool| -> Result<u32, ProtoError> {
            match parts.next() {
                Some(p) => p
                    .parse()
                    .map_err(|_| ProtoError::Malformed(format!("invalid product version {s:?}"))),
                None if required => Err(ProtoError::Malformed(format!(
                    "invalid product version {s:?}"
                ))),
                None => Ok(0),
            }
        };
        let version = Self::new(next(true)?, next(false)?, next(false)?);
        if parts.next().is_some() {
            return Err(ProtoError::Malformed(format!("invalid product version {s:?}")));
        }
        Ok(version)
    }
}

impl fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
