//! Runtime error types.

use maestro_agent::AgentError;
use maestro_core::{InvalidStateTransition, SessionId, UserId};
use maestro_store::StoreError;
use maestro_workdir::WorkdirError;
use thiserror::Error;

/// Result alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Engine-level failure.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The requested entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Identifier looked up.
        id: String,
    },

    /// Illegal session state transition; never retried.
    #[error(transparent)]
    InvalidStateTransition(#[from] InvalidStateTransition),

    /// The user is at their concurrent-session limit.
    #[error("quota exceeded for user {user_id}: {active} active of {limit} allowed")]
    QuotaExceeded {
        /// The user.
        user_id: UserId,
        /// Live sessions counted.
        active: u64,
        /// The quota.
        limit: u32,
    },

    /// The user's month-to-date spend is at or over budget.
    #[error("budget exceeded for user {user_id}: spent {spent_usd:.2} of {budget_usd:.2} USD")]
    BudgetExceeded {
        /// The user.
        user_id: UserId,
        /// Month-to-date spend.
        spent_usd: f64,
        /// The monthly budget.
        budget_usd: f64,
    },

    /// Bad request shape (unknown policy name, missing template variable).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing `{{variable}}` during task template rendering.
    #[error("template variable not provided: {0}")]
    TemplateVariable(String),

    /// The turn was cancelled by terminate or timeout.
    #[error("turn cancelled: {0}")]
    Cancelled(&'static str),

    /// A session is busy with another turn.
    #[error("session {0} already has a turn in flight")]
    Busy(SessionId),

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Working-directory failure.
    #[error(transparent)]
    Workdir(#[from] WorkdirError),

    /// Agent subprocess failure.
    #[error(transparent)]
    Agent(#[from] AgentError),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Fatal(String),
}

impl RuntimeError {
    /// Whether the failure is worth a turn-level retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Agent(e) => e.is_transient(),
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
