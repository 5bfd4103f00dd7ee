//! Group checkpoints
//!
//! A checkpoint is the full serialized state of one group (current epoch, retained
//! epochs, commit snapshots) as of the last mutation the engine performed. Exactly one
//! checkpoint exists per group id; saving replaces it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{GroupId, MarmotStorageError, Secret};

/// Lifecycle of a stored group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupLifecycle {
    /// The local member participates in the group
    Active,
    /// The local member was removed or the group was deleted
    Closed,
}

impl GroupLifecycle {
    /// Get as `&str`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for GroupLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupLifecycle {
    type Err = MarmotStorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            other => Err(MarmotStorageError::Deserialization(format!(
                "invalid group lifecycle: {other}"
            ))),
        }
    }
}

/// A persisted group checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRecord {
    /// Group id
    pub group_id: GroupId,
    /// Epoch the checkpoint was taken at
    pub epoch: u64,
    /// Lifecycle state
    pub lifecycle: GroupLifecycle,
    /// Serialized engine state; contains key material
    pub state: Secret<String>,
    /// Unix seconds of the last save
    pub updated_at: u64,
}

/// Storage for group checkpoints
pub trait GroupStorage {
    /// Insert or replace the checkpoint for `record.group_id`.
    fn save_group(&self, record: GroupRecord) -> Result<(), MarmotStorageError>;

    /// Load one checkpoint
    fn find_group(&self, group_id: &GroupId) -> Result<Option<GroupRecord>, MarmotStorageError>;

    /// All checkpoints, ordered by group id
    fn all_groups(&self) -> Result<Vec<GroupRecord>, MarmotStorageError>;

    /// Delete a checkpoint. Deleting an unknown group is not an error.
    fn delete_group(&self, group_id: &GroupId) -> Result<(), MarmotStorageError>;
}
