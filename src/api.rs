//! Buildpack and platform API versions
//!
//! Versions are written `M.N` or `vM.N`. Major version 0 is unstable and
//! only an exact match counts as compatible.

use crate::error::{PackError, PackResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// An API version pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ApiVersion {
    pub major: u64,
    pub minor: u64,
}

impl ApiVersion {
    pub const fn new(major: u64, minor: u64) -> Self {
        Self { major, minor }
    }

    /// Parse `M.N` or `vM.N`
    pub fn parse(value: &str) -> PackResult<Self> {
        let trimmed = value.trim();
        let bare = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let invalid = || PackError::ConfigInvalid(format!("could not parse '{}' as version", value));

        let (major, minor) = bare.split_once('.').ok_or_else(invalid)?;
        if major.is_empty() || minor.is_empty() {
            return Err(invalid());
        }
        let major = major.parse::<u64>().map_err(|_| invalid())?;
        let minor = minor.parse::<u64>().map_err(|_| invalid())?;
        Ok(Self { major, minor })
    }

    /// Whether two versions are interchangeable
    pub fn compatible(&self, other: &ApiVersion) -> bool {
        if self == other {
            return true;
        }
        self.major >= 1 && self.major == other.major
    }

    /// Whether an implementation of `self` can serve a consumer of `other`
    pub fn supports_version(&self, other: &ApiVersion) -> bool {
        if self == other {
            return true;
        }
        self.major != 0 && self.major == other.major && self.minor >= other.minor
    }
}

impl Default for ApiVersion {
    fn default() -> Self {
        Self::new(0, 1)
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for ApiVersion {
    type Err = PackError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ApiVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ApiVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
