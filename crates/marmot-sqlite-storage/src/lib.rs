//! SQLite-based storage for the Marmot engine.
//!
//! The sidecar opens one database file under its state directory. Every group
//! mutation is checkpointed here before the engine acknowledges it, so a restarted
//! sidecar resumes exactly where the previous process stopped.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

use std::path::Path;
use std::sync::Arc;

use marmot_storage_traits::{Backend, MarmotStorageError, MarmotStorageProvider};
use parking_lot::Mutex;
use rusqlite::Connection;

mod db;
pub mod error;
mod groups;
mod key_packages;
mod migrations;
mod processed;

use self::error::Error;

#[inline]
pub(crate) fn into_storage_err<T>(e: T) -> MarmotStorageError
where
    T: std::error::Error,
{
    MarmotStorageError::Database(e.to_string())
}

/// A SQLite-based storage implementation.
///
/// The connection sits behind a mutex; the engine serializes group mutations
/// anyway, so contention is limited to concurrent reads.
#[derive(Clone)]
pub struct MarmotSqliteStorage {
    connection: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for MarmotSqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarmotSqliteStorage").finish_non_exhaustive()
    }
}

impl MarmotSqliteStorage {
    /// Opens (or creates) the database at `file_path` and applies pending migrations.
    ///
    /// Parent directories are created when missing.
    pub fn new<P>(file_path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let file_path = file_path.as_ref();
        if let Some(parent) = file_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| Error::StateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let connection = Connection::open(file_path)?;
        Self::init(connection)
    }

    /// Creates a new in-memory [`MarmotSqliteStorage`]. Nothing is persisted.
    pub fn new_in_memory() -> Result<Self, Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut connection: Connection) -> Result<Self, Error> {
        connection.execute_batch("PRAGMA foreign_keys = ON; PRAGMA synchronous = FULL;")?;
        migrations::run_migrations(&mut connection)?;
        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    pub(crate) fn with_connection<F, T>(&self, f: F) -> T
    where
        F: FnOnce(&Connection) -> T,
    {
        let conn = self.connection.lock();
        f(&conn)
    }
}

impl MarmotStorageProvider for MarmotSqliteStorage {
    fn backend(&self) -> Backend {
        Backend::SQLite
    }
}

#[cfg(test)]
mod tests {
    use marmot_storage_traits::groups::{GroupLifecycle, GroupStorage};
    use marmot_storage_traits::key_packages::KeyPackageStorage;
    use marmot_storage_traits::processed::{ProcessedEventStorage, ProcessedOutcome};
    use marmot_storage_traits::test_utils::{group_record, key_package_record, processed_event};
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_new_in_memory() {
        let storage = MarmotSqliteStorage::new_in_memory().unwrap();
        assert_eq!(storage.backend(), Backend::SQLite);
        assert!(storage.all_groups().unwrap().is_empty());
    }

    #[test]
    fn test_new_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state").join("marmot.sqlite");
        let storage = MarmotSqliteStorage::new(&path).unwrap();
        storage.save_group(group_record(1, 0)).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("marmot.sqlite");
        drop(MarmotSqliteStorage::new(&path).unwrap());
        let storage = MarmotSqliteStorage::new(&path).unwrap();
        assert_eq!(storage.count_key_packages().unwrap(), 0);
    }

    #[test]
    fn test_closed_lifecycle_roundtrip() {
        let storage = MarmotSqliteStorage::new_in_memory().unwrap();
        let mut record = group_record(2, 5);
        record.lifecycle = GroupLifecycle::Closed;
        storage.save_group(record.clone()).unwrap();
        let found = storage.find_group(&record.group_id).unwrap().unwrap();
        assert_eq!(found, record);
    }

    #[test]
    fn test_duplicate_key_package_rejected() {
        let storage = MarmotSqliteStorage::new_in_memory().unwrap();
        storage.save_key_package(key_package_record(1)).unwrap();
        let err = storage.save_key_package(key_package_record(1)).unwrap_err();
        assert!(matches!(err, MarmotStorageError::AlreadyExists(_)));
    }

    #[test]
    fn test_processed_event_without_group() {
        let storage = MarmotSqliteStorage::new_in_memory().unwrap();
        let mut entry = processed_event(4, ProcessedOutcome::Rejected, 50);
        entry.group_id = None;
        entry.epoch = None;
        storage.save_processed_event(entry.clone()).unwrap();
        let found = storage
            .find_processed_event(&entry.event_id)
            .unwrap()
            .unwrap();
        assert_eq!(found, entry);
    }
}
