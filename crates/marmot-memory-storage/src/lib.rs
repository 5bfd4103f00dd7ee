//! Memory-based storage for the Marmot engine.
//!
//! Nothing here survives the process. It backs tests and the `--storage memory` mode
//! of the sidecar, where a restart is expected to start from an empty state.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::num::NonZeroUsize;

use lru::LruCache;
use marmot_storage_traits::groups::{GroupRecord, GroupStorage};
use marmot_storage_traits::key_packages::{KeyPackageRecord, KeyPackageStorage};
use marmot_storage_traits::processed::{ProcessedEvent, ProcessedEventStorage};
use marmot_storage_traits::{Backend, GroupId, MarmotStorageError, MarmotStorageProvider};
use parking_lot::RwLock;

/// Default number of processed-event ids kept before the oldest are evicted
pub const DEFAULT_PROCESSED_EVENT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(8192) {
    Some(v) => v,
    None => panic!("capacity must be non-zero"),
};

/// A memory-based storage implementation.
///
/// Groups are kept in a `BTreeMap` so listing is ordered by group id. The
/// processed-event ledger is an LRU bounded by its capacity; an evicted id is
/// treated as never seen.
pub struct MarmotMemoryStorage {
    inner: RwLock<Inner>,
}

struct Inner {
    groups: BTreeMap<GroupId, GroupRecord>,
    key_packages: HashMap<String, KeyPackageRecord>,
    processed: LruCache<String, ProcessedEvent>,
}

impl fmt::Debug for MarmotMemoryStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarmotMemoryStorage")
            .field("inner", &"RwLock<Inner>")
            .finish()
    }
}

impl Default for MarmotMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MarmotMemoryStorage {
    /// Creates an empty storage with the default ledger capacity.
    pub fn new() -> Self {
        Self::with_processed_capacity(DEFAULT_PROCESSED_EVENT_CAPACITY)
    }

    /// Creates an empty storage whose processed-event ledger holds at most `capacity` ids.
    pub fn with_processed_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                groups: BTreeMap::new(),
                key_packages: HashMap::new(),
                processed: LruCache::new(capacity),
            }),
        }
    }
}

impl MarmotStorageProvider for MarmotMemoryStorage {
    fn backend(&self) -> Backend {
        Backend::Memory
    }
}

impl GroupStorage for MarmotMemoryStorage {
    fn save_group(&self, record: GroupRecord) -> Result<(), MarmotStorageError> {
        self.inner.write().groups.insert(record.group_id, record);
        Ok(())
    }

    fn find_group(&self, group_id: &GroupId) -> Result<Option<GroupRecord>, MarmotStorageError> {
        Ok(self.inner.read().groups.get(group_id).cloned())
    }

    fn all_groups(&self) -> Result<Vec<GroupRecord>, MarmotStorageError> {
        Ok(self.inner.read().groups.values().cloned().collect())
    }

    fn delete_group(&self, group_id: &GroupId) -> Result<(), MarmotStorageError> {
        self.inner.write().groups.remove(group_id);
        Ok(())
    }
}

impl KeyPackageStorage for MarmotMemoryStorage {
    fn save_key_package(&self, record: KeyPackageRecord) -> Result<(), MarmotStorageError> {
        let mut inner = self.inner.write();
        if inner.key_packages.contains_key(&record.reference) {
            return Err(MarmotStorageError::AlreadyExists(format!(
                "key package {}",
                record.reference
            )));
        }
        inner.key_packages.insert(record.reference.clone(), record);
        Ok(())
    }

    fn find_key_package(
        &self,
        reference: &str,
    ) -> Result<Option<KeyPackageRecord>, MarmotStorageError> {
        Ok(self.inner.read().key_packages.get(reference).cloned())
    }

    fn delete_key_package(&self, reference: &str) -> Result<(), MarmotStorageError> {
        self.inner.write().key_packages.remove(reference);
        Ok(())
    }

    fn count_key_packages(&self) -> Result<usize, MarmotStorageError> {
        Ok(self.inner.read().key_packages.len())
    }
}

impl ProcessedEventStorage for MarmotMemoryStorage {
    fn save_processed_event(&self, event: ProcessedEvent) -> Result<(), MarmotStorageError> {
        self.inner
            .write()
            .processed
            .put(event.event_id.clone(), event);
        Ok(())
    }

    fn find_processed_event(
        &self,
        event_id: &str,
    ) -> Result<Option<ProcessedEvent>, MarmotStorageError> {
        // peek: lookups must not refresh recency
        Ok(self.inner.read().processed.peek(event_id).cloned())
    }

    fn prune_processed_events(&self, min_timestamp: u64) -> Result<usize, MarmotStorageError> {
        let mut inner = self.inner.write();
        let stale: Vec<String> = inner
            .processed
            .iter()
            .filter(|(_, e)| e.processed_at < min_timestamp)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            inner.processed.pop(id);
        }
        Ok(stale.len())
    }
}
