//! Epoch key schedule
//!
//! ```text
//! joiner_secret[n+1] = Extract(salt = init_secret[n], ikm = commit_secret)
//! epoch_secret[n+1]  = Expand(joiner_secret[n+1], "epoch", GroupContext[n+1])
//! encryption | confirm | init | exporter | authenticator = Expand(epoch_secret, label)
//! ```
//!
//! Everything after the commit secret is a deterministic function of the previous
//! epoch and the commit content, so every member applying the same commit converges
//! on identical secrets.

use std::fmt;

use marmot_storage_traits::GroupId;
use serde::{Deserialize, Serialize};

use crate::constant::PROTOCOL_LABEL;
use crate::crypto::{self, Key32};
use crate::error::Error;

/// Public binding of membership and history for one epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupContext {
    /// Group id
    pub group_id: GroupId,
    /// Epoch number
    pub epoch: u64,
    /// Hash of the leaf slots (hex)
    pub tree_hash: String,
    /// Running hash of every commit applied so far (hex)
    pub confirmed_transcript_hash: String,
}

impl GroupContext {
    /// Context of a freshly created group
    pub fn genesis(group_id: GroupId, tree_hash: [u8; 32]) -> Self {
        let transcript = crypto::hash(&[
            PROTOCOL_LABEL.as_bytes(),
            b"genesis",
            group_id.as_slice(),
        ]);
        Self {
            group_id,
            epoch: 0,
            tree_hash: hex::encode(tree_hash),
            confirmed_transcript_hash: hex::encode(transcript),
        }
    }

    /// Context after applying a commit whose content hashes to `commit_digest`
    pub fn next(&self, tree_hash: [u8; 32], commit_digest: &[u8; 32]) -> Self {
        let transcript = crypto::hash(&[
            self.confirmed_transcript_hash.as_bytes(),
            commit_digest,
        ]);
        Self {
            group_id: self.group_id,
            epoch: self.epoch + 1,
            tree_hash: hex::encode(tree_hash),
            confirmed_transcript_hash: hex::encode(transcript),
        }
    }

    pub(crate) fn digest(&self) -> [u8; 32] {
        crypto::hash(&[
            PROTOCOL_LABEL.as_bytes(),
            b"context",
            self.group_id.as_slice(),
            &self.epoch.to_be_bytes(),
            self.tree_hash.as_bytes(),
            self.confirmed_transcript_hash.as_bytes(),
        ])
    }
}

/// Secrets of one epoch
#[derive(Clone, Serialize, Deserialize)]
pub struct EpochSecrets {
    pub(crate) encryption: Key32,
    pub(crate) confirmation_key: Key32,
    pub(crate) init: Key32,
    pub(crate) exporter: Key32,
    pub(crate) authenticator: Key32,
}

impl fmt::Debug for EpochSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EpochSecrets([REDACTED])")
    }
}

impl EpochSecrets {
    /// Derive every epoch secret from the joiner secret and the new context
    pub fn derive(joiner_secret: &[u8; 32], context: &GroupContext) -> Result<Self, Error> {
        let epoch_secret = crypto::expand(joiner_secret, "epoch", &context.digest())?;
        let secret = epoch_secret.expose();
        Ok(Self {
            encryption: crypto::expand(secret, "encryption", b"")?,
            confirmation_key: crypto::expand(secret, "confirm", b"")?,
            init: crypto::expand(secret, "init", b"")?,
            exporter: crypto::expand(secret, "exporter", b"")?,
            authenticator: crypto::expand(secret, "authentication", b"")?,
        })
    }

    /// Confirmation tag over the context's transcript (hex)
    pub fn confirmation_tag(&self, context: &GroupContext) -> Result<String, Error> {
        let tag = crypto::expand(
            self.confirmation_key.expose(),
            "confirmation_tag",
            context.confirmed_transcript_hash.as_bytes(),
        )?;
        Ok(hex::encode(tag.expose()))
    }

    /// Check a received confirmation tag
    pub fn verify_confirmation_tag(&self, context: &GroupContext, tag: &str) -> Result<(), Error> {
        if self.confirmation_tag(context)? == tag {
            Ok(())
        } else {
            Err(Error::AuthenticationFailure(
                "confirmation tag mismatch".to_string(),
            ))
        }
    }

    /// Joiner secret for the next epoch
    pub fn joiner_secret(&self, commit_secret: &[u8; 32]) -> Key32 {
        crypto::extract(self.init.expose(), commit_secret)
    }

    /// Public value every member of the epoch agrees on (hex)
    pub fn epoch_authenticator(&self) -> String {
        hex::encode(self.authenticator.expose())
    }

    /// Export a labelled secret for use outside the group protocol
    pub fn export(&self, label: &str, context: &[u8]) -> Result<Key32, Error> {
        crypto::expand(self.exporter.expose(), label, context)
    }
}

/// Secrets of the epoch a local commit creates, handed back to the committer
#[derive(Debug, Clone)]
pub struct NewEpochSecrets {
    /// Epoch the commit creates
    pub epoch: u64,
    /// Public epoch authenticator (hex)
    pub epoch_authenticator: String,
    /// Exporter secret of the new epoch
    pub exporter_secret: Key32,
}
