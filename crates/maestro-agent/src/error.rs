//! Agent client error types.

use thiserror::Error;

/// Result alias for agent client operations.
pub type AgentResult<T> = Result<T, AgentError>;

/// Agent subprocess failure, classified for retry decisions.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The call is illegal in the client's current state.
    #[error("invalid client state: {operation} while {state}")]
    InvalidState {
        /// Operation attempted.
        operation: &'static str,
        /// State the client was in.
        state: String,
    },

    /// `query`/`receive` without a connected subprocess.
    #[error("agent client is not connected")]
    NotConnected,

    /// Spawn/handshake/I-O failure worth retrying.
    #[error("transient agent failure: {0}")]
    Transient(String),

    /// Unrecoverable failure (missing binary, protocol violation).
    #[error("fatal agent failure: {0}")]
    Fatal(String),

    /// The turn was cancelled (interrupt or timeout).
    #[error("agent turn cancelled")]
    Cancelled,
}

impl AgentError {
    /// Whether connect-level retry is worthwhile.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
