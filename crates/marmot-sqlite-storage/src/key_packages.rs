//! Implementation of KeyPackageStorage for SQLite storage.

use marmot_storage_traits::MarmotStorageError;
use marmot_storage_traits::key_packages::{KeyPackageRecord, KeyPackageStorage};
use rusqlite::{ErrorCode, OptionalExtension, params};

use crate::db::to_sql_timestamp;
use crate::{MarmotSqliteStorage, db, into_storage_err};

impl KeyPackageStorage for MarmotSqliteStorage {
    fn save_key_package(&self, record: KeyPackageRecord) -> Result<(), MarmotStorageError> {
        self.with_connection(|conn| {
            let result = conn.execute(
                "INSERT INTO key_packages (reference, identity, bundle, created_at)
                 VALUES (?, ?, ?, ?)",
                params![
                    record.reference,
                    record.identity,
                    record.bundle.expose(),
                    to_sql_timestamp(record.created_at),
                ],
            );
            match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(MarmotStorageError::AlreadyExists(format!(
                        "key package {}",
                        record.reference
                    )))
                }
                Err(e) => Err(into_storage_err(e)),
            }
        })
    }

    fn find_key_package(
        &self,
        reference: &str,
    ) -> Result<Option<KeyPackageRecord>, MarmotStorageError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM key_packages WHERE reference = ?")
                .map_err(into_storage_err)?;
            stmt.query_row([reference], db::row_to_key_package)
                .optional()
                .map_err(into_storage_err)
        })
    }

    fn delete_key_package(&self, reference: &str) -> Result<(), MarmotStorageError> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM key_packages WHERE reference = ?", [reference])
                .map_err(into_storage_err)?;
            Ok(())
        })
    }

    fn count_key_packages(&self) -> Result<usize, MarmotStorageError> {
        self.with_connection(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM key_packages", [], |row| row.get(0))
                .map_err(into_storage_err)?;
            Ok(usize::try_from(count).unwrap_or_default())
        })
    }
}
