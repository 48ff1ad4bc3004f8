//! Scheduler error types.

use thiserror::Error;

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Scheduling failure.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The cron expression could not be parsed.
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidCron {
        /// The expression as configured.
        expr: String,
        /// Parser message.
        reason: String,
    },

    /// The cron expression never fires again.
    #[error("cron expression {0:?} has no future occurrence")]
    NoFutureOccurrence(String),

    /// A `{{variable}}` had no value.
    #[error("template variable not provided: {0}")]
    MissingVariable(String),

    /// The task is not schedulable (no cron, disabled, deleted).
    #[error("task is not schedulable: {0}")]
    NotSchedulable(String),

    /// Persistence failure.
    #[error(transparent)]
    Store(#[from] maestro_store::StoreError),

    /// Engine failure while firing.
    #[error(transparent)]
    Runtime(#[from] maestro_runtime::RuntimeError),
}
