//! Implementation of ProcessedEventStorage for SQLite storage.

use marmot_storage_traits::MarmotStorageError;
use marmot_storage_traits::processed::{ProcessedEvent, ProcessedEventStorage};
use rusqlite::{OptionalExtension, params};

use crate::db::to_sql_timestamp;
use crate::{MarmotSqliteStorage, db, into_storage_err};

impl ProcessedEventStorage for MarmotSqliteStorage {
    fn save_processed_event(&self, event: ProcessedEvent) -> Result<(), MarmotStorageError> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO processed_events
                 (event_id, group_id, epoch, outcome, failure_reason, processed_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
                params![
                    event.event_id,
                    event.group_id.as_ref().map(|g| g.as_slice()),
                    event.epoch.map(to_sql_timestamp),
                    event.outcome.as_str(),
                    event.failure_reason,
                    to_sql_timestamp(event.processed_at),
                ],
            )
            .map_err(into_storage_err)?;
            Ok(())
        })
    }

    fn find_processed_event(
        &self,
        event_id: &str,
    ) -> Result<Option<ProcessedEvent>, MarmotStorageError> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT * FROM processed_events WHERE event_id = ?")
                .map_err(into_storage_err)?;
            stmt.query_row([event_id], db::row_to_processed_event)
                .optional()
                .map_err(into_storage_err)
        })
    }

    fn prune_processed_events(&self, min_timestamp: u64) -> Result<usize, MarmotStorageError> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM processed_events WHERE processed_at < ?",
                [to_sql_timestamp(min_timestamp)],
            )
            .map_err(into_storage_err)
        })
    }
}
