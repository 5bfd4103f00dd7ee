//! Error types for Marmot storage operations

use thiserror::Error;

/// Error type shared by every storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MarmotStorageError {
    /// Database operation failed
    #[error("database error: {0}")]
    Database(String),

    /// Serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization failed
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Requested item was not found
    #[error("not found: {0}")]
    NotFound(String),

    /// A record with the same key already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),
}

impl From<serde_json::Error> for MarmotStorageError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            Self::Deserialization(e.to_string())
        } else {
            Self::Serialization(e.to_string())
        }
    }
}
