//! Helpers shared by the engine integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicU64, Ordering};

use marmot_group::{CommitBundle, GroupId, MarmotEngine};
use marmot_storage_traits::MarmotStorageProvider;
use marmot_memory_storage::MarmotMemoryStorage;
use nostr::{EventId, Keys};

pub type MemoryEngine = MarmotEngine<MarmotMemoryStorage>;

static NEXT_EVENT: AtomicU64 = AtomicU64::new(1);

/// A unique event id. Ids handed out later compare greater.
pub fn next_event_id() -> EventId {
    let n = NEXT_EVENT.fetch_add(1, Ordering::Relaxed);
    let mut bytes = [0u8; 32];
    bytes[0] = 0x40;
    bytes[24..].copy_from_slice(&n.to_be_bytes());
    EventId::from_slice(&bytes).unwrap()
}

pub fn engine() -> MemoryEngine {
    MarmotEngine::new(Keys::generate(), MarmotMemoryStorage::default())
}

/// Apply `bundle` on every engine in `members` under one event id
pub fn apply_everywhere<S: MarmotStorageProvider>(bundle: &CommitBundle, members: &[&MarmotEngine<S>]) -> EventId {
    let event_id = next_event_id();
    for member in members {
        member.apply_commit(&bundle.commit, event_id).unwrap();
    }
    event_id
}

/// Add each of `joiners` in one commit by `committer`; `existing` excludes the committer
pub fn add_members<S: MarmotStorageProvider>(
    group_id: &GroupId,
    committer: &MarmotEngine<S>,
    existing: &[&MarmotEngine<S>],
    joiners: &[&MarmotEngine<S>],
) {
    let proposals = joiners
        .iter()
        .map(|j| {
            let kp = j.create_key_package().unwrap();
            committer.propose_add(group_id, kp).unwrap()
        })
        .collect();
    let bundle = committer.commit(group_id, proposals).unwrap();

    let mut appliers = vec![committer];
    appliers.extend_from_slice(existing);
    apply_everywhere(&bundle, &appliers);

    for joiner in joiners {
        let (_, welcome) = bundle
            .welcomes
            .iter()
            .find(|(identity, _)| *identity == joiner.identity())
            .unwrap();
        joiner.process_welcome(welcome, next_event_id()).unwrap();
    }
}

/// Leaf index of `identity` in the committer's view
pub fn leaf_of<S: MarmotStorageProvider>(engine: &MarmotEngine<S>, group_id: &GroupId, member: &MarmotEngine<S>) -> u32 {
    engine
        .get_group(group_id)
        .unwrap()
        .members
        .iter()
        .find(|m| m.identity == member.identity())
        .unwrap()
        .leaf_index
}
