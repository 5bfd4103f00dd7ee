//! Marmot group errors

use marmot_storage_traits::MarmotStorageError;
use nostr::nips::nip44;
use nostr::{EventId, key};

/// Group engine error
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum Error {
    /// Hex error
    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
    /// Keys error
    #[error(transparent)]
    Keys(#[from] key::Error),
    /// NIP44 error
    #[error(transparent)]
    NIP44(#[from] nip44::Error),
    /// Storage error
    #[error(transparent)]
    Storage(#[from] MarmotStorageError),
    /// A proposal targets a missing member or carries a malformed key package
    #[error("invalid proposal: {0}")]
    InvalidProposal(String),
    /// Another commit already advanced the epoch and wins the tie-break
    #[error("commit conflict at epoch {epoch}: commit {applied} already applied")]
    CommitConflict {
        /// Epoch both commits target
        epoch: u64,
        /// Winning commit event id
        applied: EventId,
    },
    /// The message targets an epoch the group has not reached
    #[error("epoch mismatch: group is at epoch {expected}, message targets epoch {received}")]
    EpochMismatch {
        /// Local epoch
        expected: u64,
        /// Epoch named by the message
        received: u64,
    },
    /// The message targets an epoch whose secrets were discarded
    #[error("stale epoch {0}: secrets no longer retained")]
    StaleEpoch(u64),
    /// A signature, confirmation tag or AEAD check failed
    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),
    /// No pending key package matches the welcome
    #[error("no pending key package matches the welcome")]
    UnknownWelcome,
    /// Group not found
    #[error("group not found")]
    GroupNotFound,
    /// The local member was removed or the group was deleted
    #[error("group is closed")]
    GroupClosed,
    /// The event id was already processed
    #[error("event {0} already processed")]
    AlreadyProcessed(EventId),
    /// Own application messages are not decrypted
    #[error("cannot decrypt own message")]
    CannotDecryptOwnMessage,
    /// Message belongs to a different group
    #[error("message group id doesn't match the group")]
    WrongGroupId,
    /// Crypto primitive failure
    #[error("crypto error: {0}")]
    Crypto(String),
    /// (De)serialization failure
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl Error {
    /// Whether re-delivering the same event can never succeed.
    ///
    /// Terminal failures are recorded in the processed-event ledger; an
    /// [`Error::EpochMismatch`] is not, since the event becomes processable
    /// once the group catches up.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InvalidProposal(_)
                | Self::CommitConflict { .. }
                | Self::StaleEpoch(_)
                | Self::AuthenticationFailure(_)
                | Self::WrongGroupId
                | Self::CannotDecryptOwnMessage
                | Self::UnknownWelcome
        )
    }
}
