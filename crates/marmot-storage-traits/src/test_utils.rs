//! Record builders shared by backend tests

use crate::groups::{GroupLifecycle, GroupRecord};
use crate::key_packages::KeyPackageRecord;
use crate::processed::{ProcessedEvent, ProcessedOutcome};
use crate::{GroupId, Secret, unix_now};

/// A deterministic group id derived from a single byte
pub fn group_id(seed: u8) -> GroupId {
    GroupId::from_bytes([seed; 32])
}

/// An active checkpoint at `epoch` with a recognisable state blob
pub fn group_record(seed: u8, epoch: u64) -> GroupRecord {
    GroupRecord {
        group_id: group_id(seed),
        epoch,
        lifecycle: GroupLifecycle::Active,
        state: Secret::new(format!("{{\"seed\":{seed},\"epoch\":{epoch}}}")),
        updated_at: unix_now(),
    }
}

/// A key package bundle with reference `ref-{seed}`
pub fn key_package_record(seed: u8) -> KeyPackageRecord {
    KeyPackageRecord {
        reference: format!("ref-{seed}"),
        identity: hex::encode([seed; 32]),
        bundle: Secret::new(format!("{{\"bundle\":{seed}}}")),
        created_at: unix_now(),
    }
}

/// A ledger entry for event `{seed}` repeated to 64 hex chars
pub fn processed_event(seed: u8, outcome: ProcessedOutcome, processed_at: u64) -> ProcessedEvent {
    ProcessedEvent {
        event_id: hex::encode([seed; 32]),
        group_id: Some(group_id(seed)),
        epoch: Some(1),
        outcome,
        failure_reason: matches!(outcome, ProcessedOutcome::Rejected)
            .then(|| "stale epoch".to_string()),
        processed_at,
    }
}
