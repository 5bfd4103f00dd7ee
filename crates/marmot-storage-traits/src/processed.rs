//! Processed-event ledger
//!
//! Every Nostr event the engine acts on (commit, welcome, application message) is
//! recorded by id, so a re-delivered event resolves to the recorded outcome instead of
//! touching group state twice.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{GroupId, MarmotStorageError};

/// What happened when an event was processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedOutcome {
    /// A commit advanced the group
    CommitApplied,
    /// A welcome created the group locally
    WelcomeProcessed,
    /// An application message was decrypted
    Decrypted,
    /// The event was rejected; see the failure reason
    Rejected,
}

impl ProcessedOutcome {
    /// Get as `&str`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CommitApplied => "commit_applied",
            Self::WelcomeProcessed => "welcome_processed",
            Self::Decrypted => "decrypted",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ProcessedOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessedOutcome {
    type Err = MarmotStorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit_applied" => Ok(Self::CommitApplied),
            "welcome_processed" => Ok(Self::WelcomeProcessed),
            "decrypted" => Ok(Self::Decrypted),
            "rejected" => Ok(Self::Rejected),
            other => Err(MarmotStorageError::Deserialization(format!(
                "invalid processed outcome: {other}"
            ))),
        }
    }
}

/// One ledger entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedEvent {
    /// Nostr event id (hex)
    pub event_id: String,
    /// Group the event belonged to, when known
    pub group_id: Option<GroupId>,
    /// Group epoch after processing
    pub epoch: Option<u64>,
    /// Outcome
    pub outcome: ProcessedOutcome,
    /// Why the event was rejected
    pub failure_reason: Option<String>,
    /// Unix seconds
    pub processed_at: u64,
}

/// Storage for the processed-event ledger
pub trait ProcessedEventStorage {
    /// Record an event. Re-recording the same id replaces the entry.
    fn save_processed_event(&self, event: ProcessedEvent) -> Result<(), MarmotStorageError>;

    /// Look up an event by id
    fn find_processed_event(
        &self,
        event_id: &str,
    ) -> Result<Option<ProcessedEvent>, MarmotStorageError>;

    /// Drop entries processed before `min_timestamp`; returns how many were removed
    fn prune_processed_events(&self, min_timestamp: u64) -> Result<usize, MarmotStorageError>;
}
