//! Store error types.

use thiserror::Error;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence failure, classified the way callers retry.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested row does not exist (or is soft-deleted).
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind, e.g. `"session"`.
        entity: &'static str,
        /// The identifier looked up.
        id: String,
    },

    /// An invariant would be violated (duplicate sequence, illegal state
    /// transition, duplicate tool_use_id). Never retried.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The database was busy or locked; the caller may retry.
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// Unexpected storage failure; surfaces as an internal error.
    #[error("storage failure: {0}")]
    Fatal(String),
}

impl StoreError {
    /// Shorthand for a missing row.
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the caller may usefully retry the operation.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked => {
                    Self::Transient(err.to_string())
                },
                rusqlite::ErrorCode::ConstraintViolation => Self::Conflict(err.to_string()),
                _ => Self::Fatal(err.to_string()),
            },
            rusqlite::Error::QueryReturnedNoRows => {
                Self::not_found("row", "query returned no rows")
            },
            _ => Self::Fatal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Fatal(format!("payload (de)serialization failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constraint_violation_maps_to_conflict() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            Some("UNIQUE constraint failed".into()),
        );
        assert!(matches!(StoreError::from(err), StoreError::Conflict(_)));
    }

    #[test]
    fn busy_maps_to_transient() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        let mapped = StoreError::from(err);
        assert!(mapped.is_transient());
    }
}
