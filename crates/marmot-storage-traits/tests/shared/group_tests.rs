//! Group checkpoint test functions

use marmot_storage_traits::GroupId;
use marmot_storage_traits::groups::{GroupLifecycle, GroupStorage};

use super::create_test_group;

/// Save, find, and miss
pub fn test_save_and_find_group<S>(storage: S)
where
    S: GroupStorage,
{
    let group = create_test_group(1, 0);
    storage.save_group(group.clone()).unwrap();

    let found = storage.find_group(&group.group_id).unwrap().unwrap();
    assert_eq!(found.group_id, group.group_id);
    assert_eq!(found.epoch, 0);
    assert_eq!(found.lifecycle, GroupLifecycle::Active);
    assert_eq!(found.state.expose(), group.state.expose());

    let missing = storage
        .find_group(&GroupId::from_bytes([99; 32]))
        .unwrap();
    assert!(missing.is_none());
}

/// A second save replaces the checkpoint instead of duplicating it
pub fn test_save_replaces_checkpoint<S>(storage: S)
where
    S: GroupStorage,
{
    storage.save_group(create_test_group(2, 0)).unwrap();
    let mut next = create_test_group(2, 1);
    next.lifecycle = GroupLifecycle::Closed;
    storage.save_group(next.clone()).unwrap();

    let all = storage.all_groups().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].epoch, 1);
    assert_eq!(all[0].lifecycle, GroupLifecycle::Closed);
    assert_eq!(all[0].state.expose(), next.state.expose());
}

/// Listing is ordered by group id
pub fn test_all_groups<S>(storage: S)
where
    S: GroupStorage,
{
    assert!(storage.all_groups().unwrap().is_empty());

    storage.save_group(create_test_group(9, 3)).unwrap();
    storage.save_group(create_test_group(4, 1)).unwrap();
    storage.save_group(create_test_group(6, 2)).unwrap();

    let ids: Vec<GroupId> = storage
        .all_groups()
        .unwrap()
        .into_iter()
        .map(|g| g.group_id)
        .collect();
    assert_eq!(
        ids,
        vec![
            GroupId::from_bytes([4; 32]),
            GroupId::from_bytes([6; 32]),
            GroupId::from_bytes([9; 32]),
        ]
    );
}

/// Deleting removes the checkpoint; deleting twice is fine
pub fn test_delete_group<S>(storage: S)
where
    S: GroupStorage,
{
    let group = create_test_group(5, 7);
    storage.save_group(group.clone()).unwrap();
    storage.delete_group(&group.group_id).unwrap();
    assert!(storage.find_group(&group.group_id).unwrap().is_none());
    storage.delete_group(&group.group_id).unwrap();
}
