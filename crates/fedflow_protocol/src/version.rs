//! Model version identifiers.
//!
//! Versions are strings of the form `v<N>` where `N` is a positive
//! decimal integer with no leading zeros. They are strictly ordered by
//! `N` and only ever advance by one at aggregation time. Everything
//! outside this module treats them as opaque tokens.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A validated model version identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelVersion(u64);

impl ModelVersion {
    /// The version the coordinator starts from when no model has been
    /// persisted yet.
    pub fn initial() -> Self {
        Self(1)
    }

    /// The version that follows this one.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// The numeric component of the identifier.
    pub const fn number(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl FromStr for ModelVersion {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix('v')
            .ok_or_else(|| VersionError::Invalid(s.to_string()))?;
        if digits.is_empty() || digits.starts_with('0') {
            return Err(VersionError::Invalid(s.to_string()));
        }
        if !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(VersionError::Invalid(s.to_string()));
        }
        let number = digits
            .parse::<u64>()
            .map_err(|_| VersionError::Invalid(s.to_string()))?;
        Ok(Self(number))
    }
}

impl TryFrom<String> for ModelVersion {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModelVersion> for String {
    fn from(value: ModelVersion) -> Self {
        value.to_string()
    }
}

/// Check whether a raw string is a well-formed version identifier.
pub fn is_valid(s: &str) -> bool {
    s.parse::<ModelVersion>().is_ok()
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid model version: '{0}'. Expected format: v1, v2, v3, ...")]
    Invalid(String),
}
