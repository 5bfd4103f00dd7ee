//! Implementation of GroupStorage for SQLite storage.

use marmot_storage_traits::groups::{GroupRecord, GroupStorage};
use marmot_storage_traits::{GroupId, MarmotStorageError};
use rusqlite::{OptionalExtension, params};

use crate::db::to_sql_timestamp;
use crate::{MarmotSqliteStorage, db, into_storage_err};

impl GroupStorage for MarmotSqliteStorage {
    fn save_group(&self, record: GroupRecord) -> Result<(), MarmotStorageError> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO groups (group_id, epoch, lifecycle, state, updated_at)
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    record.group_id.as_slice(),
                    to_sql_timestamp(record.epoch),
                    record.lifecycle.as_str(),
                    record.state.expose(),
                    to_sql_timestamp(record.updated_at),
                ],
            )
            .map_err(into_storage_err)?;
            Ok(())
        })
    }

    fn find_group(&self, group_id: &GroupId) -> Result<Option<GroupRecord>, MarmotStorageError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM groups WHERE group_id = ?")
                .map_err(into_storage_err)?;
            stmt.query_row([group_id.as_slice()], db::row_to_group)
                .optional()
                .map_err(into_storage_err)
        })
    }

    fn all_groups(&self) -> Result<Vec<GroupRecord>, MarmotStorageError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM groups ORDER BY group_id ASC")
                .map_err(into_storage_err)?;
            let rows = stmt
                .query_map([], db::row_to_group)
                .map_err(into_storage_err)?;

            let mut groups = Vec::new();
            for row in rows {
                match row {
                    Ok(group) => groups.push(group),
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to deserialize group row, skipping");
                    }
                }
            }
            Ok(groups)
        })
    }

    fn delete_group(&self, group_id: &GroupId) -> Result<(), MarmotStorageError> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM groups WHERE group_id = ?", [group_id.as_slice()])
                .map_err(into_storage_err)?;
            Ok(())
        })
    }
}
