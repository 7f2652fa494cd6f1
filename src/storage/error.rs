//! Storage errors

use thiserror::Error;

/// Errors from opening, migrating, writing or reading a store
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("failed to connect to {backend} store at {target}: {message}")]
    ConnectionFailed {
        backend: String,
        target: String,
        message: String,
    },

    /// The store is held by another process (SQLite busy/locked).
    /// Retry after that process exits.
    #[error("database is locked: {0}")]
    Locked(String),

    #[error("schema migration failed: {0}")]
    MigrationFailed(String),

    #[error(
        "schema is incompatible ({0}); delete the database and fetch again"
    )]
    IncompatibleSchema(String),

    #[error("unsupported database type: {0} (expected sqlite3, mysql, postgres or redis)")]
    UnsupportedBackend(String),

    #[error("serialization failed: {0}")]
    SerializationFailed(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("{context}: {message}")]
    Query { context: String, message: String },
}

impl StoreError {
    pub fn connection(
        backend: impl Into<String>,
        target: impl Into<String>,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::ConnectionFailed {
            backend: backend.into(),
            target: target.into(),
            message: message.to_string(),
        }
    }

    pub fn query(context: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Query {
            context: context.into(),
            message: message.to_string(),
        }
    }

    pub fn serialization(message: impl std::fmt::Display) -> Self {
        Self::SerializationFailed(message.to_string())
    }

    /// Only a lock held by another process clears up by itself
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Locked(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e)
    }
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Reject a batch size that would make chunking impossible
pub(crate) fn check_batch_size(batch_size: usize) -> StoreResult<()> {
    if batch_size < 1 {
        return Err(StoreError::Configuration(
            "batch-size must be at least 1".to_string(),
        ));
    }
    Ok(())
}
