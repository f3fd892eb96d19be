//! Shared domain types

use crate::error::{LokiError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Digest algorithm used for file fingerprints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
        }
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = LokiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            other => Err(LokiError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Genome assembly build, expressed as the UCSC `hg` number.
///
/// Builds order numerically, so the newest build of a store is simply the
/// maximum over its sources. Parsing accepts `hg19` or `19`; GRCh names are
/// rejected since the GRCh to hg mapping lives in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Build(pub i64);

impl Build {
    pub fn number(self) -> i64 {
        self.0
    }
}

impl From<i64> for Build {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl FromStr for Build {
    type Err = LokiError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("hg")
            .or_else(|| trimmed.strip_prefix("HG"))
            .unwrap_or(trimmed);
        match digits.parse::<i64>() {
            Ok(n) if n > 0 => Ok(Self(n)),
            _ => Err(LokiError::InvalidBuild(s.to_string())),
        }
    }
}

impl fmt::Display for Build {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hg{}", self.0)
    }
}

/// Size, modification time and digest of one source input file.
///
/// `filename` is relative to the source's download directory so that
/// fingerprints stay comparable when the cache directory moves.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub filename: String,
    pub size: i64,
    /// Unix timestamp (seconds)
    pub modified: i64,
    pub md5: String,
}

impl FileFingerprint {
    /// Two fingerprints describe the same content when name, size and digest
    /// agree. Modification time is informational only.
    pub fn same_content(&self, other: &FileFingerprint) -> bool {
        self.filename == other.filename && self.size == other.size && self.md5 == other.md5
    }
}
