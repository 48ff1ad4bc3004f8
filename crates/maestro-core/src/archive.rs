//! Archive vocabulary shared by the workdir manager, store, and config.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Compression applied to a session archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    /// `tar` stream through gzip (`.tar.gz`). The default.
    #[default]
    Gzip,
    /// A zip container with deflate entries (`.zip`).
    Zip,
    /// An uncompressed `tar` stream (`.tar`).
    Tar,
}

impl Compression {
    /// File extension for archives of this kind.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Gzip => "tar.gz",
            Self::Zip => "zip",
            Self::Tar => "tar",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gzip => write!(f, "gzip"),
            Self::Zip => write!(f, "zip"),
            Self::Tar => write!(f, "tar"),
        }
    }
}

impl FromStr for Compression {
    type Err = UnknownCompression;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gzip" | "gz" | "tar.gz" | "tgz" => Ok(Self::Gzip),
            "zip" => Ok(Self::Zip),
            "tar" => Ok(Self::Tar),
            other => Err(UnknownCompression(other.to_string())),
        }
    }
}

/// Unrecognised compression name in configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown archive compression: {0} (expected gzip, zip, or tar)")]
pub struct UnknownCompression(pub String);

/// One entry of a deterministic archive manifest, sorted by `relpath`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the workdir root, `/`-separated.
    pub relpath: String,
    /// File size in bytes.
    pub size: u64,
    /// Lowercase hex SHA-256 of the file contents.
    pub sha256: String,
}
