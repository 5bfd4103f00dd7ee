//! IPC frames between the host and the sidecar
//!
//! The host opens with [`Frame::Hello`]; the sidecar answers [`Frame::Ready`] with
//! its own protocol version and identity. After that the host sends
//! [`Frame::Request`]s, each carrying a correlation id, and the sidecar answers
//! each with a [`Frame::Response`] carrying the same id. Unsolicited
//! [`Frame::Event`]s share the stream and are told apart by their frame tag.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use marmot_group::{
    ApplicationMessage, Commit, CommitBundle, CommitOutcome, DecryptedMessage, GroupId,
    GroupSummary, KeyPackage, Proposal, ProposalMessage, ProposalReceived, Welcome,
};
use nostr::{EventId, PublicKey};
use serde::{Deserialize, Serialize};

/// Version spoken by this build. Both sides must agree exactly.
pub const PROTOCOL_VERSION: u32 = 2;

/// One frame on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// First frame from the host
    Hello {
        /// Host protocol version
        protocol_version: u32,
    },
    /// Sidecar reply to `Hello`
    Ready {
        /// Sidecar protocol version
        protocol_version: u32,
        /// Identity the sidecar signs with
        identity: PublicKey,
    },
    /// Host request
    Request {
        /// Correlation id, unique per connection
        id: u64,
        /// Operation
        op: Op,
    },
    /// Sidecar answer to the request with the same id
    Response {
        /// Correlation id of the request
        id: u64,
        /// Result
        outcome: Outcome,
    },
    /// Unsolicited notification
    Event(Notification),
}

/// Operations the sidecar performs on behalf of the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Op {
    /// Generate and store a key package
    CreateKeyPackage,
    /// Create a group at epoch 0 with the local member alone
    CreateGroup,
    /// Summary of one group
    GetGroup {
        /// Group
        group_id: GroupId,
    },
    /// Summaries of every stored group
    ListGroups,
    /// Close and erase a group
    DeleteGroup {
        /// Group
        group_id: GroupId,
    },
    /// Stage adding the owner of a key package
    ProposeAdd {
        /// Group
        group_id: GroupId,
        /// Key package of the new member
        key_package: KeyPackage,
    },
    /// Stage removing the member at a leaf
    ProposeRemove {
        /// Group
        group_id: GroupId,
        /// Leaf to remove
        leaf_index: u32,
    },
    /// Stage replacing the local encryption key
    ProposeUpdate {
        /// Group
        group_id: GroupId,
    },
    /// Sign a proposal for another member to commit
    SignProposal {
        /// Group
        group_id: GroupId,
        /// Proposal
        proposal: Proposal,
    },
    /// Verify and queue a proposal received from the network
    ReceiveProposal {
        /// Signed proposal
        message: ProposalMessage,
        /// Event carrying it
        event_id: EventId,
    },
    /// Build a commit over `proposals`
    Commit {
        /// Group
        group_id: GroupId,
        /// Proposals to commit
        proposals: Vec<Proposal>,
    },
    /// Commit every proposal received in the current epoch
    CommitReceived {
        /// Group
        group_id: GroupId,
    },
    /// Apply a commit received from the network
    ApplyCommit {
        /// Commit
        commit: Commit,
        /// Event carrying it
        event_id: EventId,
    },
    /// Encrypt under the current epoch
    Encrypt {
        /// Group
        group_id: GroupId,
        /// Base64 plaintext
        plaintext: String,
    },
    /// Decrypt an application message received from the network
    Decrypt {
        /// Ciphertext
        message: ApplicationMessage,
        /// Event carrying it
        event_id: EventId,
    },
    /// Join a group from a welcome
    ProcessWelcome {
        /// Welcome
        welcome: Welcome,
        /// Event carrying it
        event_id: EventId,
    },
    /// Stop serving after answering
    Shutdown,
}

impl Op {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateKeyPackage => "create_key_package",
            Self::CreateGroup => "create_group",
            Self::GetGroup { .. } => "get_group",
            Self::ListGroups => "list_groups",
            Self::DeleteGroup { .. } => "delete_group",
            Self::ProposeAdd { .. } => "propose_add",
            Self::ProposeRemove { .. } => "propose_remove",
            Self::ProposeUpdate { .. } => "propose_update",
            Self::SignProposal { .. } => "sign_proposal",
            Self::ReceiveProposal { .. } => "receive_proposal",
            Self::Commit { .. } => "commit",
            Self::CommitReceived { .. } => "commit_received",
            Self::ApplyCommit { .. } => "apply_commit",
            Self::Encrypt { .. } => "encrypt",
            Self::Decrypt { .. } => "decrypt",
            Self::ProcessWelcome { .. } => "process_welcome",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Result of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "body", rename_all = "snake_case")]
pub enum Outcome {
    /// The operation succeeded
    Ok(Reply),
    /// The operation failed
    Error(WireError),
}

/// Successful results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Reply {
    /// A new key package
    KeyPackage(KeyPackage),
    /// One group
    Group(GroupSummary),
    /// Every group
    Groups(Vec<GroupSummary>),
    /// A staged proposal
    Proposal(Proposal),
    /// A signed proposal
    ProposalMessage(ProposalMessage),
    /// A proposal was queued
    ProposalReceived(ProposalReceived),
    /// A commit to publish, if any
    Commit(Option<CommitBundle>),
    /// A commit was applied
    CommitApplied(CommitOutcome),
    /// Ciphertext to publish
    Encrypted(ApplicationMessage),
    /// Decrypted application message
    Decrypted(Plaintext),
    /// Acknowledgement with no data
    Done,
}

/// A decrypted message as it crosses the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plaintext {
    /// Group
    pub group_id: GroupId,
    /// Epoch it was encrypted under
    pub epoch: u64,
    /// Sender leaf
    pub sender_leaf: u32,
    /// Sender identity
    pub sender: PublicKey,
    /// Base64 content
    pub content: String,
}

impl Plaintext {
    /// Decoded content
    pub fn bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.content)
    }
}

impl From<DecryptedMessage> for Plaintext {
    fn from(message: DecryptedMessage) -> Self {
        Self {
            group_id: message.group_id,
            epoch: message.epoch,
            sender_leaf: message.sender_leaf,
            sender: message.sender,
            content: BASE64.encode(&message.plaintext),
        }
    }
}

/// Encode plaintext for [`Op::Encrypt`]
pub fn encode_plaintext(plaintext: &[u8]) -> String {
    BASE64.encode(plaintext)
}

pub(crate) fn decode_plaintext(plaintext: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(plaintext)
}

/// Notification pushed by the sidecar
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// The group moved to a new epoch
    EpochAdvanced {
        /// Group
        group_id: GroupId,
        /// New epoch
        epoch: u64,
        /// Set when a competing commit was rolled back first
        rolled_back_from: Option<u64>,
    },
    /// A member left the group
    MemberRemoved {
        /// Group
        group_id: GroupId,
        /// Epoch in which the removal took effect
        epoch: u64,
        /// Removed identity
        identity: PublicKey,
    },
    /// The local member was removed by a commit. Until the removal is final a
    /// concurrent commit that keeps the member can still win the epoch.
    Removed {
        /// Group
        group_id: GroupId,
        /// Last epoch the member was part of
        epoch: u64,
    },
    /// A winning concurrent commit undid the local member's removal
    Reinstated {
        /// Group
        group_id: GroupId,
        /// Epoch after the winning commit
        epoch: u64,
    },
    /// A commit made here lost its epoch to a concurrent commit and was undone
    CommitDiscarded {
        /// Group
        group_id: GroupId,
        /// Epoch the commit was built against
        epoch: u64,
        /// Event that carried it
        event_id: EventId,
        /// Identities it would have added
        added: Vec<PublicKey>,
        /// Identities it would have removed
        removed: Vec<PublicKey>,
    },
    /// The group was deleted locally
    GroupClosed {
        /// Group
        group_id: GroupId,
        /// Epoch at closing
        epoch: u64,
    },
    /// The local member joined a group from a welcome
    GroupJoined {
        /// Group
        group_id: GroupId,
        /// Epoch joined at
        epoch: u64,
        /// Number of members
        members: usize,
    },
}

impl Notification {
    /// Group the notification concerns
    pub fn group_id(&self) -> GroupId {
        match self {
            Self::EpochAdvanced { group_id, .. }
            | Self::MemberRemoved { group_id, .. }
            | Self::Removed { group_id, .. }
            | Self::Reinstated { group_id, .. }
            | Self::CommitDiscarded { group_id, .. }
            | Self::GroupClosed { group_id, .. }
            | Self::GroupJoined { group_id, .. } => *group_id,
        }
    }
}

/// Error category, mirroring the engine's taxonomy so hosts can match on it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Target member missing or key package malformed
    InvalidProposal,
    /// A competing commit won the tie-break
    CommitConflict,
    /// The message targets a future epoch
    EpochMismatch,
    /// The message targets a discarded epoch
    StaleEpoch,
    /// A signature, tag or AEAD check failed
    AuthenticationFailure,
    /// No pending key package matches the welcome
    UnknownWelcome,
    /// No such group
    GroupNotFound,
    /// The group is closed
    GroupClosed,
    /// The event was processed before
    AlreadyProcessed,
    /// Own application messages are not decrypted
    OwnMessage,
    /// The request could not be understood
    BadRequest,
    /// Storage or other internal failure
    Internal,
}

/// An error as it crosses the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct WireError {
    /// Category
    pub code: ErrorCode,
    /// Human readable detail
    pub message: String,
}

impl WireError {
    /// New error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<&marmot_group::Error> for WireError {
    fn from(e: &marmot_group::Error) -> Self {
        use marmot_group::Error;

        let code = match e {
            Error::InvalidProposal(_) => ErrorCode::InvalidProposal,
            Error::CommitConflict { .. } => ErrorCode::CommitConflict,
            Error::EpochMismatch { .. } => ErrorCode::EpochMismatch,
            Error::StaleEpoch(_) => ErrorCode::StaleEpoch,
            Error::AuthenticationFailure(_) => ErrorCode::AuthenticationFailure,
            Error::UnknownWelcome => ErrorCode::UnknownWelcome,
            Error::GroupNotFound => ErrorCode::GroupNotFound,
            Error::GroupClosed => ErrorCode::GroupClosed,
            Error::AlreadyProcessed(_) => ErrorCode::AlreadyProcessed,
            Error::CannotDecryptOwnMessage => ErrorCode::OwnMessage,
            Error::WrongGroupId | Error::Serialization(_) | Error::Hex(_) => ErrorCode::BadRequest,
            Error::Keys(_) | Error::NIP44(_) | Error::Storage(_) | Error::Crypto(_) => {
                ErrorCode::Internal
            }
        };
        Self::new(code, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let frame = Frame::Request {
            id: 7,
            op: Op::GetGroup {
                group_id: GroupId::from_bytes([1; 32]),
            },
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["frame"], "request");
        assert_eq!(json["id"], 7);
        assert_eq!(json["op"]["type"], "get_group");
        assert_eq!(serde_json::from_value::<Frame>(json).unwrap(), frame);
    }

    #[test]
    fn test_event_frame_carries_type_and_group() {
        let frame = Frame::Event(Notification::GroupClosed {
            group_id: GroupId::from_bytes([2; 32]),
            epoch: 4,
        });
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["frame"], "event");
        assert_eq!(json["type"], "group_closed");
        assert_eq!(json["group_id"], GroupId::from_bytes([2; 32]).to_hex());
        assert_eq!(serde_json::from_value::<Frame>(json).unwrap(), frame);
    }

    #[test]
    fn test_error_response_roundtrip() {
        let frame = Frame::Response {
            id: 3,
            outcome: Outcome::Error(WireError::new(ErrorCode::StaleEpoch, "stale epoch 1")),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(serde_json::from_str::<Frame>(&json).unwrap(), frame);
    }

    #[test]
    fn test_engine_error_codes() {
        let err = marmot_group::Error::EpochMismatch {
            expected: 1,
            received: 3,
        };
        assert_eq!(WireError::from(&err).code, ErrorCode::EpochMismatch);
        assert_eq!(
            WireError::from(&marmot_group::Error::UnknownWelcome).code,
            ErrorCode::UnknownWelcome
        );
    }

    #[test]
    fn test_plaintext_content() {
        let text = Plaintext {
            group_id: GroupId::from_bytes([3; 32]),
            epoch: 0,
            sender_leaf: 1,
            sender: nostr::Keys::generate().public_key(),
            content: encode_plaintext(b"hello"),
        };
        assert_eq!(text.bytes().unwrap(), b"hello");
    }
}
