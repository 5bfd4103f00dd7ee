//! Group state survives an engine restart on SQLite

mod common;

use common::{add_members, engine, next_event_id};
use marmot_group::MarmotEngine;
use marmot_sqlite_storage::MarmotSqliteStorage;
use nostr::Keys;
use tempfile::TempDir;

#[test]
fn test_restart_resumes_at_persisted_epoch() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("marmot.db");
    let keys = Keys::generate();
    let bob = engine();

    let alice = MarmotEngine::new(keys.clone(), MarmotSqliteStorage::new(&db).unwrap());
    let group_id = alice.create_group().unwrap().group_id;

    let kp = bob.create_key_package().unwrap();
    let add = alice.propose_add(&group_id, kp).unwrap();
    let bundle = alice.commit(&group_id, vec![add]).unwrap();
    alice.apply_commit(&bundle.commit, next_event_id()).unwrap();
    bob.process_welcome(&bundle.welcomes[0].1, next_event_id()).unwrap();

    let first = alice.encrypt(&group_id, b"before restart").unwrap();
    let summary = alice.get_group(&group_id).unwrap();
    drop(alice);

    let alice = MarmotEngine::new(keys, MarmotSqliteStorage::new(&db).unwrap());
    assert_eq!(alice.get_group(&group_id).unwrap(), summary);

    // the sending ratchet continued past the persisted generation
    let second = alice.encrypt(&group_id, b"after restart").unwrap();
    assert!(second.generation > first.generation);
    assert_eq!(bob.decrypt(&first, next_event_id()).unwrap().plaintext, b"before restart");
    assert_eq!(bob.decrypt(&second, next_event_id()).unwrap().plaintext, b"after restart");
}

#[test]
fn test_ledger_survives_restart() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("marmot.db");
    let keys = Keys::generate();

    let event_id = next_event_id();
    let group_id = {
        let alice = MarmotEngine::new(keys.clone(), MarmotSqliteStorage::new(&db).unwrap());
        let group_id = alice.create_group().unwrap().group_id;
        let bundle = alice.commit(&group_id, vec![]).unwrap();
        alice.apply_commit(&bundle.commit, event_id).unwrap();
        group_id
    };

    let alice = MarmotEngine::new(keys, MarmotSqliteStorage::new(&db).unwrap());
    let stale = alice.commit(&group_id, vec![]).unwrap();
    assert!(matches!(
        alice.apply_commit(&stale.commit, event_id),
        Err(marmot_group::Error::AlreadyProcessed(_))
    ));
}

#[test]
fn test_key_package_consumed_by_welcome() {
    let alice = engine();
    let bob = engine();
    let group_id = alice.create_group().unwrap().group_id;
    add_members(&group_id, &alice, &[], &[&bob]);
    assert_eq!(bob.pending_key_packages().unwrap(), 0);
}
