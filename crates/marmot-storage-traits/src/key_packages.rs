//! Private halves of published key packages
//!
//! A key package is published with its public init key; the matching private key stays
//! here until a Welcome referencing the package is processed, at which point it is
//! consumed and deleted.

use crate::{MarmotStorageError, Secret};

/// A stored key package bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPackageRecord {
    /// Hex sha256 reference of the public key package
    pub reference: String,
    /// Identity public key (hex) the package was issued for
    pub identity: String,
    /// Serialized bundle including the private init key
    pub bundle: Secret<String>,
    /// Unix seconds of creation
    pub created_at: u64,
}

/// Storage for key package bundles
pub trait KeyPackageStorage {
    /// Store a new bundle. Fails with [`MarmotStorageError::AlreadyExists`] on a duplicate reference.
    fn save_key_package(&self, record: KeyPackageRecord) -> Result<(), MarmotStorageError>;

    /// Look up a bundle by reference
    fn find_key_package(
        &self,
        reference: &str,
    ) -> Result<Option<KeyPackageRecord>, MarmotStorageError>;

    /// Remove a bundle once consumed. Removing an unknown reference is not an error.
    fn delete_key_package(&self, reference: &str) -> Result<(), MarmotStorageError>;

    /// Number of unconsumed bundles
    fn count_key_packages(&self) -> Result<usize, MarmotStorageError>;
}
