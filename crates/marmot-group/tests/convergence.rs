//! Members applying the same commits in epoch order agree on the group state

mod common;

use common::{add_members, apply_everywhere, engine, leaf_of};

fn assert_converged(group_id: &marmot_group::GroupId, engines: &[&common::MemoryEngine]) {
    let first = engines[0].get_group(group_id).unwrap();
    for other in &engines[1..] {
        let summary = other.get_group(group_id).unwrap();
        assert_eq!(summary.epoch, first.epoch);
        assert_eq!(summary.members, first.members);
        assert_eq!(summary.epoch_authenticator, first.epoch_authenticator);
        assert_eq!(summary.designated_committer, first.designated_committer);
    }
}

#[test]
fn test_adds_and_removes_converge() {
    let alice = engine();
    let bob = engine();
    let carol = engine();
    let dave = engine();

    let group_id = alice.create_group().unwrap().group_id;

    add_members(&group_id, &alice, &[], &[&bob]);
    assert_converged(&group_id, &[&alice, &bob]);

    add_members(&group_id, &alice, &[&bob], &[&carol, &dave]);
    assert_converged(&group_id, &[&alice, &bob, &carol, &dave]);
    assert_eq!(alice.get_group(&group_id).unwrap().epoch, 2);

    let remove = alice
        .propose_remove(&group_id, leaf_of(&alice, &group_id, &carol))
        .unwrap();
    let bundle = alice.commit(&group_id, vec![remove]).unwrap();
    apply_everywhere(&bundle, &[&alice, &bob, &dave]);
    assert_converged(&group_id, &[&alice, &bob, &dave]);
    assert_eq!(alice.get_group(&group_id).unwrap().members.len(), 3);
}

#[test]
fn test_removed_leaf_is_reused_identically() {
    let alice = engine();
    let bob = engine();
    let carol = engine();
    let erin = engine();

    let group_id = alice.create_group().unwrap().group_id;
    add_members(&group_id, &alice, &[], &[&bob, &carol]);

    let bob_leaf = leaf_of(&alice, &group_id, &bob);
    let remove = alice.propose_remove(&group_id, bob_leaf).unwrap();
    let bundle = alice.commit(&group_id, vec![remove]).unwrap();
    apply_everywhere(&bundle, &[&alice, &carol]);

    add_members(&group_id, &alice, &[&carol], &[&erin]);
    assert_eq!(leaf_of(&carol, &group_id, &erin), bob_leaf);
    assert_converged(&group_id, &[&alice, &carol, &erin]);
}

#[test]
fn test_update_proposal_from_member_converges() {
    let alice = engine();
    let bob = engine();
    let carol = engine();

    let group_id = alice.create_group().unwrap().group_id;
    add_members(&group_id, &alice, &[], &[&bob, &carol]);

    // bob is not the designated committer, so he sends a proposal
    let update = bob.propose_update(&group_id).unwrap();
    let message = bob.proposal_message(&group_id, update).unwrap();
    let received = alice
        .receive_proposal(message.clone(), common::next_event_id())
        .unwrap();
    assert!(received.should_commit);
    let at_carol = carol.receive_proposal(message, common::next_event_id()).unwrap();
    assert!(!at_carol.should_commit);

    // holding the proposal is not enough to commit it
    assert!(carol.commit_received_proposals(&group_id).unwrap().is_none());
    let bundle = alice.commit_received_proposals(&group_id).unwrap().unwrap();
    apply_everywhere(&bundle, &[&alice, &bob, &carol]);
    assert_converged(&group_id, &[&alice, &bob, &carol]);

    // the updated key is usable: bob can follow the next commit
    let bundle = alice.commit(&group_id, vec![]).unwrap();
    apply_everywhere(&bundle, &[&alice, &bob, &carol]);
    assert_converged(&group_id, &[&alice, &bob, &carol]);
}

#[test]
fn test_no_received_proposals_means_no_commit() {
    let alice = engine();
    let group_id = alice.create_group().unwrap().group_id;
    assert!(alice.commit_received_proposals(&group_id).unwrap().is_none());
}
