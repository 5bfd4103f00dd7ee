//! Marmot storage - the durable state owned by the sidecar process.
//!
//! The group engine checkpoints every mutation through these traits, so a restarted
//! sidecar resumes from the last persisted epoch of each group. Storage is deliberately
//! dumb: group state arrives as an opaque serialized blob and is never interpreted here.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

pub mod error;
pub mod group_id;
pub mod groups;
pub mod key_packages;
pub mod processed;
/// Secret wrapper for zeroization
pub mod secret;
#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use error::MarmotStorageError;
pub use group_id::GroupId;
pub use secret::{Secret, Zeroize};

use self::groups::GroupStorage;
use self::key_packages::KeyPackageStorage;
use self::processed::ProcessedEventStorage;

/// Backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// Memory
    Memory,
    /// SQLite
    SQLite,
}

impl Backend {
    /// Check if it's a persistent backend
    ///
    /// All values different from [`Backend::Memory`] are considered persistent
    pub fn is_persistent(&self) -> bool {
        !matches!(self, Self::Memory)
    }
}

/// Storage provider for the Marmot engine.
///
/// Implementors provide group checkpoints, the private halves of published key
/// packages, and the processed-event ledger used for idempotent replay.
pub trait MarmotStorageProvider:
    GroupStorage + KeyPackageStorage + ProcessedEventStorage + Send + Sync
{
    /// Returns the backend type.
    fn backend(&self) -> Backend;
}

/// Current unix time in seconds, saturating to zero on a pre-epoch clock.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_is_persistent() {
        assert!(!Backend::Memory.is_persistent());
        assert!(Backend::SQLite.is_persistent());
    }

    #[test]
    fn test_unix_now_is_recent() {
        // 2024-01-01
        assert!(unix_now() > 1_704_067_200);
    }
}
