//! Error types for the outbox store.

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, OutboxStoreError>;

/// Errors that can occur during outbox store operations.
#[derive(Error, Debug)]
pub enum OutboxStoreError {
    /// The database could not be reached (connection loss, pool exhaustion).
    /// Callers treat the current cycle as skipped, not failed.
    #[error("storage unavailable: {0}")]
    Unavailable(#[source] sqlx::Error),

    /// Query execution failed for a reason other than transport.
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    /// Payload or metadata could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OutboxStoreError {
    /// True when the error signals that the database is unreachable rather
    /// than that a statement was rejected.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, OutboxStoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for OutboxStoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => OutboxStoreError::Unavailable(err),
            other => OutboxStoreError::Database(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_errors_classify_as_unavailable() {
        let err: OutboxStoreError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_unavailable());

        let err: OutboxStoreError = sqlx::Error::PoolClosed.into();
        assert!(err.is_unavailable());
    }

    #[test]
    fn row_not_found_classifies_as_database() {
        let err: OutboxStoreError = sqlx::Error::RowNotFound.into();
        assert!(!err.is_unavailable());
    }
}
