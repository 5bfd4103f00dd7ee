//! Key packages
//!
//! A key package announces that an identity can be added to a group. It binds the
//! identity key to a fresh init key; the Welcome for the new member is sealed to
//! that init key, and the matching private half waits in storage until consumed.

use marmot_storage_traits::Secret;
use nostr::{Keys, PublicKey};
use serde::{Deserialize, Serialize};

use crate::constant::{DEFAULT_CAPABILITIES, PROTOCOL_LABEL, REQUIRED_CAPABILITY};
use crate::crypto::{self, Key32};
use crate::error::Error;

/// Public key package, published as a kind 443 event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPackage {
    /// Identity key of the member
    pub identity: PublicKey,
    /// Key the Welcome is sealed to; becomes the member's leaf encryption key
    pub init_key: PublicKey,
    /// Capability flags
    pub capabilities: Vec<String>,
    /// Unix seconds
    pub created_at: u64,
    /// Identity signature (hex)
    pub signature: String,
}

impl KeyPackage {
    fn signed_digest(&self) -> [u8; 32] {
        let caps = self.capabilities.join(",");
        crypto::hash(&[
            PROTOCOL_LABEL.as_bytes(),
            b"key_package",
            self.identity.to_hex().as_bytes(),
            self.init_key.to_hex().as_bytes(),
            caps.as_bytes(),
            &self.created_at.to_be_bytes(),
        ])
    }

    /// Check the identity signature and required capabilities.
    pub fn validate(&self) -> Result<(), Error> {
        crypto::verify(&self.identity, &self.signed_digest(), &self.signature)
            .map_err(|e| Error::InvalidProposal(format!("key package: {e}")))?;
        if !self.capabilities.iter().any(|c| c == REQUIRED_CAPABILITY) {
            return Err(Error::InvalidProposal(format!(
                "key package lacks capability {REQUIRED_CAPABILITY}"
            )));
        }
        Ok(())
    }

    /// Stable reference a Welcome uses to name this package (hex sha256)
    pub fn reference(&self) -> String {
        hex::encode(crypto::hash(&[
            self.signed_digest().as_slice(),
            self.signature.as_bytes(),
        ]))
    }
}

/// A key package plus its private init key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPackageBundle {
    /// Public part
    pub key_package: KeyPackage,
    /// Private init key
    pub init_secret: Key32,
}

impl KeyPackageBundle {
    /// Create a fresh key package for `identity`.
    pub fn generate(identity: &Keys, created_at: u64) -> Result<Self, Error> {
        let init = Keys::generate();
        let mut key_package = KeyPackage {
            identity: identity.public_key(),
            init_key: init.public_key(),
            capabilities: DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            created_at,
            signature: String::new(),
        };
        key_package.signature = crypto::sign(identity, &key_package.signed_digest())?;

        Ok(Self {
            key_package,
            init_secret: crypto::secret_of(&init)?,
        })
    }

    /// The init key pair
    pub fn init_keys(&self) -> Result<Keys, Error> {
        crypto::keys_from_secret(self.init_secret.expose())
    }

    /// Serialize for storage
    pub fn to_stored(&self) -> Result<Secret<String>, Error> {
        Ok(Secret::new(serde_json::to_string(self)?))
    }

    /// Parse a stored bundle
    pub fn from_stored(stored: &Secret<String>) -> Result<Self, Error> {
        Ok(serde_json::from_str(stored.expose())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_key_package_validates() {
        let identity = Keys::generate();
        let bundle = KeyPackageBundle::generate(&identity, 1_700_000_000).unwrap();
        bundle.key_package.validate().unwrap();
        assert_eq!(bundle.key_package.identity, identity.public_key());
        assert_eq!(
            bundle.init_keys().unwrap().public_key(),
            bundle.key_package.init_key
        );
    }

    #[test]
    fn test_tampered_key_package_is_invalid_proposal() {
        let identity = Keys::generate();
        let mut kp = KeyPackageBundle::generate(&identity, 1).unwrap().key_package;
        kp.init_key = Keys::generate().public_key();
        assert!(matches!(kp.validate(), Err(Error::InvalidProposal(_))));
    }

    #[test]
    fn test_missing_capability_is_invalid() {
        let identity = Keys::generate();
        let mut kp = KeyPackageBundle::generate(&identity, 1).unwrap().key_package;
        kp.capabilities = vec!["update".to_string()];
        kp.signature = crypto::sign(&identity, &kp.signed_digest()).unwrap();
        assert!(matches!(kp.validate(), Err(Error::InvalidProposal(_))));
    }

    #[test]
    fn test_reference_is_stable() {
        let identity = Keys::generate();
        let kp = KeyPackageBundle::generate(&identity, 1).unwrap().key_package;
        assert_eq!(kp.reference(), kp.clone().reference());
        assert_eq!(kp.reference().len(), 64);
    }

    #[test]
    fn test_bundle_stored_roundtrip() {
        let identity = Keys::generate();
        let bundle = KeyPackageBundle::generate(&identity, 1).unwrap();
        let stored = bundle.to_stored().unwrap();
        let parsed = KeyPackageBundle::from_stored(&stored).unwrap();
        assert_eq!(parsed.key_package, bundle.key_package);
        assert_eq!(parsed.init_secret.expose(), bundle.init_secret.expose());
    }
}
