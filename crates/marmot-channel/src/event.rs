//! What the channel reports to the host

use marmot_sidecar::ErrorCode;
use marmot_storage_traits::GroupId;
use nostr::{EventId, PublicKey, Timestamp};

/// Channel event, delivered in arrival order per group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A decrypted application message
    Message {
        /// Conversation
        conversation_id: String,
        /// Group
        group_id: GroupId,
        /// Sender identity
        sender: PublicKey,
        /// Epoch it was encrypted under
        epoch: u64,
        /// Carrying event
        event_id: EventId,
        /// `created_at` of the carrying event
        created_at: Timestamp,
        /// Plaintext
        content: Vec<u8>,
    },
    /// One message could not be decrypted; the group is unaffected
    DecryptFailed {
        /// Conversation
        conversation_id: String,
        /// Group
        group_id: GroupId,
        /// Carrying event
        event_id: EventId,
        /// Why (stale epoch or failed authentication)
        code: ErrorCode,
    },
    /// The local member joined a group from a welcome
    Joined {
        /// Conversation created for it
        conversation_id: String,
        /// Group
        group_id: GroupId,
        /// Epoch joined at
        epoch: u64,
        /// Members at join time
        members: Vec<PublicKey>,
    },
    /// A commit was applied
    EpochAdvanced {
        /// Conversation
        conversation_id: String,
        /// Group
        group_id: GroupId,
        /// New epoch
        epoch: u64,
        /// Set when a competing commit was rolled back
        rolled_back_from: Option<u64>,
    },
    /// A member left the group
    MemberRemoved {
        /// Conversation
        conversation_id: String,
        /// Group
        group_id: GroupId,
        /// Epoch after the removal
        epoch: u64,
        /// Removed identity
        identity: PublicKey,
    },
    /// The local member was removed or the group was deleted
    Closed {
        /// Conversation
        conversation_id: String,
        /// Group
        group_id: GroupId,
    },
    /// A removal reported as [`ChannelEvent::Closed`] was undone by a concurrent
    /// commit that won the epoch; the conversation continues
    Reinstated {
        /// Conversation
        conversation_id: String,
        /// Group
        group_id: GroupId,
        /// Epoch after the winning commit
        epoch: u64,
    },
    /// A commit published here lost its epoch to a concurrent commit and was
    /// rolled back. Its changes did not happen; re-issue them if still wanted.
    CommitRolledBack {
        /// Conversation
        conversation_id: String,
        /// Group
        group_id: GroupId,
        /// Epoch the commit was built against
        epoch: u64,
        /// Event that carried the commit
        commit_event_id: EventId,
        /// Identities it would have added
        added: Vec<PublicKey>,
        /// Identities it would have removed
        removed: Vec<PublicKey>,
    },
    /// A message from a future epoch stayed undecryptable after a resync
    ResyncFailed {
        /// Conversation
        conversation_id: String,
        /// Group
        group_id: GroupId,
        /// Carrying event
        event_id: EventId,
        /// Cause
        reason: String,
    },
    /// Fragments of a message never completed
    IncompleteMessage {
        /// Group, if the fragments named one
        group_id: Option<GroupId>,
        /// Message id
        message_id: String,
    },
    /// The sidecar could not be restarted; no group makes progress
    EngineDown {
        /// Launch attempts made
        attempts: u32,
    },
}

impl ChannelEvent {
    /// Group the event concerns
    pub fn group_id(&self) -> Option<GroupId> {
        match self {
            Self::Message { group_id, .. }
            | Self::DecryptFailed { group_id, .. }
            | Self::Joined { group_id, .. }
            | Self::EpochAdvanced { group_id, .. }
            | Self::MemberRemoved { group_id, .. }
            | Self::Closed { group_id, .. }
            | Self::Reinstated { group_id, .. }
            | Self::CommitRolledBack { group_id, .. }
            | Self::ResyncFailed { group_id, .. } => Some(*group_id),
            Self::IncompleteMessage { group_id, .. } => *group_id,
            Self::EngineDown { .. } => None,
        }
    }
}
