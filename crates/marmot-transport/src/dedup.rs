//! Bounded window of delivered event ids

use std::num::NonZeroUsize;

use lru::LruCache;
use nostr::EventId;

/// Remembers the most recent event ids. Event ids are content hashes, so a
/// hit is always an exact duplicate.
#[derive(Debug)]
pub struct DedupWindow {
    seen: LruCache<EventId, ()>,
}

impl DedupWindow {
    /// Window holding at most `capacity` ids
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            seen: LruCache::new(capacity),
        }
    }

    /// Record `id`; returns `false` if it was already in the window
    pub fn insert(&mut self, id: EventId) -> bool {
        self.seen.put(id, ()).is_none()
    }

    /// Forget `id`
    pub fn remove(&mut self, id: &EventId) -> bool {
        self.seen.pop(id).is_some()
    }

    /// Whether `id` is in the window
    pub fn contains(&self, id: &EventId) -> bool {
        self.seen.contains(id)
    }

    /// Number of ids held
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether the window is empty
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
