//! API version negotiation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Newest API version this daemon speaks.
pub const CURRENT_API_VERSION: ApiVersion = ApiVersion::new(1, 47);

/// Oldest API version still accepted.
pub const MIN_API_VERSION: ApiVersion = ApiVersion::new(1, 24);

/// A `major.minor` API version, e.g. `1.44`.
///
/// Accepts an optional leading `v` when parsing so that path prefixes
/// like `/v1.44/build` can be handed over verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// True when this version is at least `major.minor`.
    pub fn at_least(&self, major: u32, minor: u32) -> bool {
        *self >= ApiVersion::new(major, minor)
    }
}

impl Default for ApiVersion {
    fn default() -> Self {
        CURRENT_API_VERSION
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Error returned when a version string is not `major.minor`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid API version: {0:?}")]
pub struct ParseVersionError(pub String);

impl FromStr for ApiVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.strip_prefix('v').unwrap_or(s);
        let (major, minor) = trimmed
            .split_once('.')
            .ok_or_else(|| ParseVersionError(s.to_string()))?;
        let major = major
            .parse()
            .map_err(|_| ParseVersionError(s.to_string()))?;
        let minor = minor
            .parse()
            .map_err(|_| ParseVersionError(s.to_string()))?;
        Ok(ApiVersion { major, minor })
    }
}

impl Serialize for ApiVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ApiVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
