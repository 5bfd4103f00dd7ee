//! Marmot group engine
//!
//! An MLS-style group key agreement state machine for closed-group messaging over
//! Nostr. A group advances through epochs by commits; every epoch has its own
//! derived secrets, per-sender hash ratchets for application messages, and a
//! confirmation tag that members check to agree on the state.
//!
//! [`MarmotEngine`] wraps the state machine with durable storage: it owns exactly
//! one authoritative [`Group`] per group id, checkpoints it after every mutation,
//! and records processed Nostr event ids so re-delivered events have no effect.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

mod constant;
pub mod crypto;
pub mod engine;
mod epoch_snapshots;
pub mod error;
pub mod group;
pub mod key_packages;
pub mod key_schedule;
pub mod messages;
pub mod proposals;
mod ratchet;
#[cfg(test)]
pub(crate) mod test_util;
pub mod tree;

pub use self::constant::{DEFAULT_CAPABILITIES, MAX_GROUP_SIZE, PROTOCOL_LABEL, REQUIRED_CAPABILITY};
pub use self::engine::{CommitBundle, MarmotEngine, MarmotEngineBuilder, ProposalReceived};
pub use self::error::Error;
pub use self::group::{
    CommitOutcome, CommitResult, DecryptedMessage, DiscardedCommit, Group, GroupSummary, MemberSummary,
};
pub use self::key_packages::{KeyPackage, KeyPackageBundle};
pub use self::messages::{ApplicationMessage, Commit, MlsMessage, Welcome};
pub use self::proposals::{Proposal, ProposalMessage};

// Re-export GroupId for convenience
pub use marmot_storage_traits::GroupId;

/// Configuration for group behavior
///
/// All fields have defaults suited to Nostr relays, which neither order nor
/// reliably deliver events.
///
/// # Examples
///
/// ```rust
/// use marmot_group::GroupConfig;
///
/// let config = GroupConfig {
///     out_of_order_tolerance: 50,
///     ..Default::default()
/// };
/// assert_eq!(config.epoch_retention, 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupConfig {
    /// Number of superseded epochs whose secrets are kept for late ciphertext.
    ///
    /// Decrypting a message from an older epoch fails with [`Error::StaleEpoch`].
    ///
    /// Default: 5
    pub epoch_retention: usize,

    /// Number of skipped message keys kept per sender for out-of-order delivery.
    ///
    /// Higher values reduce forward secrecy within an epoch.
    ///
    /// Default: 100
    pub out_of_order_tolerance: u32,

    /// Maximum number of generations a sender ratchet may be advanced in one step.
    ///
    /// Default: 1000
    pub maximum_forward_distance: u32,

    /// Number of pre-commit snapshots kept for commit race rollback.
    ///
    /// Default: 5
    pub snapshot_retention: usize,

    /// Seconds a member removed by a commit keeps the state from before the
    /// removal, so a concurrent commit that wins the epoch can reinstate it.
    /// Afterwards the removal is final and those secrets are erased.
    ///
    /// Default: 600 (10 minutes)
    pub removal_grace_secs: u64,

    /// Age after which processed-event ledger entries are pruned on startup.
    ///
    /// Default: 3888000 (45 days)
    pub processed_event_ttl_secs: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            epoch_retention: 5,
            out_of_order_tolerance: 100,
            maximum_forward_distance: 1000,
            snapshot_retention: 5,
            removal_grace_secs: 600,
            processed_event_ttl_secs: 3888000, // 45 days
        }
    }
}

impl GroupConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }
}
