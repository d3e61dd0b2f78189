//! Four-part installer versions (`major.minor.build.revision`).
//!
//! Each part is 16 bits, so a version packs into a single `u64` and compares
//! numerically. Missing trailing parts are zero (`1.2` == `1.2.0.0`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VersionError {
    #[error("Empty version string")]
    Empty,

    #[error("Version '{input}' has more than four parts")]
    TooManyParts { input: String },

    #[error("Version '{input}' has invalid part '{part}'")]
    InvalidPart { input: String, part: String },
}

/// A packed four-part version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[derive(Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    pub const fn new(major: u16, minor: u16, build: u16, revision: u16) -> Self {
        Self(
            ((major as u64) << 48)
                | ((minor as u64) << 32)
                | ((build as u64) << 16)
                | (revision as u64),
        )
    }

    #[inline]
    pub const fn from_packed(packed: u64) -> Self {
        Self(packed)
    }

    #[inline]
    pub const fn packed(self) -> u64 {
        self.0
    }

    pub const fn major(self) -> u16 {
        (self.0 >> 48) as u16
    }

    pub const fn minor(self) -> u16 {
        (self.0 >> 32) as u16
    }

    pub const fn build(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn revision(self) -> u16 {
        self.0 as u16
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let trimmed = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err(VersionError::Empty);
        }

        let mut parts = [0u16; 4];
        for (i, part) in trimmed.split('.').enumerate() {
            if i >= 4 {
                return Err(VersionError::TooManyParts {
                    input: s.to_string(),
                });
            }
            parts[i] = part.parse().map_err(|_| VersionError::InvalidPart {
                input: s.to_string(),
                part: part.to_string(),
            })?;
        }

        Ok(Self::new(parts[0], parts[1], parts[2], parts[3]))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major(),
            self.minor(),
            self.build(),
            self.revision()
        )
    }
}
