//! Key package and processed-event test functions

use marmot_storage_traits::MarmotStorageError;
use marmot_storage_traits::key_packages::KeyPackageStorage;
use marmot_storage_traits::processed::{ProcessedEvent, ProcessedEventStorage, ProcessedOutcome};
use marmot_storage_traits::GroupId;

use super::create_test_key_package;

/// Key packages are stored once, found by reference, and consumed
pub fn test_key_package_lifecycle<S>(storage: S)
where
    S: KeyPackageStorage,
{
    let kp = create_test_key_package(3);
    storage.save_key_package(kp.clone()).unwrap();
    assert_eq!(storage.count_key_packages().unwrap(), 1);

    let found = storage.find_key_package(&kp.reference).unwrap().unwrap();
    assert_eq!(found.identity, kp.identity);
    assert_eq!(found.bundle.expose(), kp.bundle.expose());

    let dup = storage.save_key_package(kp.clone());
    assert!(matches!(dup, Err(MarmotStorageError::AlreadyExists(_))));

    storage.delete_key_package(&kp.reference).unwrap();
    assert!(storage.find_key_package(&kp.reference).unwrap().is_none());
    assert_eq!(storage.count_key_packages().unwrap(), 0);
    storage.delete_key_package(&kp.reference).unwrap();
}

fn entry(seed: u8, outcome: ProcessedOutcome, processed_at: u64) -> ProcessedEvent {
    ProcessedEvent {
        event_id: hex::encode([seed; 32]),
        group_id: Some(GroupId::from_bytes([seed; 32])),
        epoch: Some(2),
        outcome,
        failure_reason: matches!(outcome, ProcessedOutcome::Rejected)
            .then(|| "authentication failure".to_string()),
        processed_at,
    }
}

/// Entries round-trip and re-recording replaces
pub fn test_processed_event_roundtrip<S>(storage: S)
where
    S: ProcessedEventStorage,
{
    let first = entry(1, ProcessedOutcome::Rejected, 100);
    storage.save_processed_event(first.clone()).unwrap();
    let found = storage.find_processed_event(&first.event_id).unwrap().unwrap();
    assert_eq!(found, first);

    let replaced = entry(1, ProcessedOutcome::Decrypted, 101);
    storage.save_processed_event(replaced.clone()).unwrap();
    let found = storage.find_processed_event(&first.event_id).unwrap().unwrap();
    assert_eq!(found.outcome, ProcessedOutcome::Decrypted);
    assert_eq!(found.failure_reason, None);

    assert!(
        storage
            .find_processed_event(&hex::encode([8u8; 32]))
            .unwrap()
            .is_none()
    );
}

/// Pruning removes only entries older than the cutoff
pub fn test_prune_processed_events<S>(storage: S)
where
    S: ProcessedEventStorage,
{
    storage
        .save_processed_event(entry(1, ProcessedOutcome::CommitApplied, 10))
        .unwrap();
    storage
        .save_processed_event(entry(2, ProcessedOutcome::Decrypted, 20))
        .unwrap();
    storage
        .save_processed_event(entry(3, ProcessedOutcome::WelcomeProcessed, 30))
        .unwrap();

    let removed = storage.prune_processed_events(25).unwrap();
    assert_eq!(removed, 2);
    assert!(
        storage
            .find_processed_event(&hex::encode([1u8; 32]))
            .unwrap()
            .is_none()
    );
    assert!(
        storage
            .find_processed_event(&hex::encode([3u8; 32]))
            .unwrap()
            .is_some()
    );
}
