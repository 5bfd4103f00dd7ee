//! Storage conformance functions shared by every backend

#![allow(dead_code)]

pub mod group_tests;
pub mod ledger_tests;

use marmot_storage_traits::groups::{GroupLifecycle, GroupRecord};
use marmot_storage_traits::key_packages::KeyPackageRecord;
use marmot_storage_traits::{GroupId, Secret, unix_now};

pub fn create_test_group(seed: u8, epoch: u64) -> GroupRecord {
    GroupRecord {
        group_id: GroupId::from_bytes([seed; 32]),
        epoch,
        lifecycle: GroupLifecycle::Active,
        state: Secret::new(format!("{{\"seed\":{seed},\"epoch\":{epoch}}}")),
        updated_at: unix_now(),
    }
}

pub fn create_test_key_package(seed: u8) -> KeyPackageRecord {
    KeyPackageRecord {
        reference: hex::encode([seed; 32]),
        identity: hex::encode([seed.wrapping_add(1); 32]),
        bundle: Secret::new(format!("{{\"bundle\":{seed}}}")),
        created_at: unix_now(),
    }
}
