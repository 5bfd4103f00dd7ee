//! Shared helpers for unit tests

use marmot_memory_storage::MarmotMemoryStorage;
use nostr::{EventId, Keys};

use crate::engine::MarmotEngine;
use crate::key_packages::KeyPackageBundle;

/// Deterministic event id made of one repeated byte
pub fn event_id(byte: u8) -> EventId {
    EventId::from_slice(&[byte; 32]).unwrap()
}

/// Fresh identity with a key package bundle
pub fn new_member() -> (Keys, KeyPackageBundle) {
    let keys = Keys::generate();
    let bundle = KeyPackageBundle::generate(&keys, 1_700_000_000).unwrap();
    (keys, bundle)
}

/// Engine over memory storage for a fresh identity
pub fn memory_engine() -> MarmotEngine<MarmotMemoryStorage> {
    MarmotEngine::new(Keys::generate(), MarmotMemoryStorage::default())
}
