//! Workdir error types.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias for workdir operations.
pub type WorkdirResult<T> = Result<T, WorkdirError>;

/// Filesystem lifecycle failure.
#[derive(Debug, Error)]
pub enum WorkdirError {
    /// The directory or archive does not exist.
    #[error("path not found: {0}")]
    NotFound(PathBuf),

    /// An I/O operation failed.
    #[error("io error on {path}: {source}")]
    Io {
        /// Path the operation touched.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Archive encoding/decoding failed.
    #[error("archive error: {0}")]
    Archive(String),

    /// The blocking-pool task was cancelled or panicked.
    #[error("background task failed: {0}")]
    Join(String),
}

impl WorkdirError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
