//! Row conversion helpers.

use std::io::{Error as IoError, ErrorKind};
use std::str::FromStr;

use marmot_storage_traits::groups::{GroupLifecycle, GroupRecord};
use marmot_storage_traits::key_packages::KeyPackageRecord;
use marmot_storage_traits::processed::{ProcessedEvent, ProcessedOutcome};
use marmot_storage_traits::{GroupId, MarmotStorageError, Secret};
use rusqlite::types::Type;
use rusqlite::{Error, Result as SqliteResult, Row};

#[inline]
fn map_to_text_boxed_error<T>(e: T) -> Error
where
    T: std::error::Error + Send + Sync + 'static,
{
    Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
}

#[inline]
fn invalid_data(msg: String) -> Error {
    map_to_text_boxed_error(IoError::new(ErrorKind::InvalidData, msg))
}

fn group_id_from_blob(blob: &[u8]) -> SqliteResult<GroupId> {
    GroupId::from_slice(blob).map_err(|e: MarmotStorageError| invalid_data(e.to_string()))
}

/// Unix seconds are stored as INTEGER; negative values never come from this crate.
fn timestamp(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

pub(crate) fn to_sql_timestamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Convert a row to a [`GroupRecord`]
pub fn row_to_group(row: &Row) -> SqliteResult<GroupRecord> {
    let group_id: Vec<u8> = row.get("group_id")?;
    let epoch: i64 = row.get("epoch")?;
    let lifecycle: String = row.get("lifecycle")?;
    let state: String = row.get("state")?;
    let updated_at: i64 = row.get("updated_at")?;

    Ok(GroupRecord {
        group_id: group_id_from_blob(&group_id)?,
        epoch: timestamp(epoch),
        lifecycle: GroupLifecycle::from_str(&lifecycle).map_err(map_to_text_boxed_error)?,
        state: Secret::new(state),
        updated_at: timestamp(updated_at),
    })
}

/// Convert a row to a [`KeyPackageRecord`]
pub fn row_to_key_package(row: &Row) -> SqliteResult<KeyPackageRecord> {
    let created_at: i64 = row.get("created_at")?;
    Ok(KeyPackageRecord {
        reference: row.get("reference")?,
        identity: row.get("identity")?,
        bundle: Secret::new(row.get::<_, String>("bundle")?),
        created_at: timestamp(created_at),
    })
}

/// Convert a row to a [`ProcessedEvent`]
pub fn row_to_processed_event(row: &Row) -> SqliteResult<ProcessedEvent> {
    let group_id: Option<Vec<u8>> = row.get("group_id")?;
    let epoch: Option<i64> = row.get("epoch")?;
    let outcome: String = row.get("outcome")?;
    let processed_at: i64 = row.get("processed_at")?;

    Ok(ProcessedEvent {
        event_id: row.get("event_id")?,
        group_id: group_id.as_deref().map(group_id_from_blob).transpose()?,
        epoch: epoch.map(timestamp),
        outcome: ProcessedOutcome::from_str(&outcome).map_err(map_to_text_boxed_error)?,
        failure_reason: row.get("failure_reason")?,
        processed_at: timestamp(processed_at),
    })
}
