//! Errors raised while opening the sidecar database.
//!
//! Once open, storage failures surface as [`MarmotStorageError`] through the
//! storage traits.

use std::path::PathBuf;

use marmot_storage_traits::MarmotStorageError;

/// Failure to open or migrate the database
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The directory holding the database file could not be created
    #[error("cannot create state directory {}: {source}", path.display())]
    StateDir {
        /// Directory
        path: PathBuf,
        /// Cause
        source: std::io::Error,
    },
    /// SQLite refused to open or configure the connection
    #[error("SQLite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    /// Schema migration failed
    #[error("Migration error: {0}")]
    Refinery(#[from] refinery::Error),
}

impl From<Error> for MarmotStorageError {
    fn from(e: Error) -> Self {
        Self::Database(e.to_string())
    }
}
