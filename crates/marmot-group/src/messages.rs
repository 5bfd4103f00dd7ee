//! Protocol messages carried over Nostr

use marmot_storage_traits::GroupId;
use nostr::PublicKey;
use serde::{Deserialize, Serialize};

use crate::constant::PROTOCOL_LABEL;
use crate::crypto::{self, Key32};
use crate::error::Error;
use crate::key_schedule::GroupContext;
use crate::proposals::{Proposal, ProposalMessage};
use crate::tree::Leaves;

/// Commit secret sealed to one existing member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedPathSecret {
    /// Recipient leaf
    pub leaf_index: u32,
    /// NIP-44 payload
    pub ciphertext: String,
}

/// Fresh key material of the committer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePath {
    /// Committer's new leaf encryption key
    pub encryption_key: PublicKey,
    /// Ephemeral key the secrets are sealed from
    pub sender_key: PublicKey,
    /// One entry per member that was already in the group and stays in it
    pub secrets: Vec<EncryptedPathSecret>,
}

/// Advances a group from `epoch` to `epoch + 1`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Group
    pub group_id: GroupId,
    /// Epoch the commit is made against
    pub epoch: u64,
    /// Committer leaf
    pub committer: u32,
    /// Proposals, applied updates first, then removes, then adds
    pub proposals: Vec<Proposal>,
    /// Committer path
    pub path: UpdatePath,
    /// Confirmation tag of the new epoch (hex)
    pub confirmation_tag: String,
    /// Committer identity signature (hex)
    pub signature: String,
}

impl Commit {
    /// Hash of everything but the tag and signature; feeds the transcript
    pub fn content_digest(&self) -> Result<[u8; 32], Error> {
        let proposals = serde_json::to_vec(&self.proposals)?;
        let path = serde_json::to_vec(&self.path)?;
        Ok(crypto::hash(&[
            PROTOCOL_LABEL.as_bytes(),
            b"commit",
            self.group_id.as_slice(),
            &self.epoch.to_be_bytes(),
            &self.committer.to_be_bytes(),
            &proposals,
            &path,
        ]))
    }

    pub(crate) fn signed_digest(&self) -> Result<[u8; 32], Error> {
        Ok(crypto::hash(&[
            &self.content_digest()?,
            self.confirmation_tag.as_bytes(),
        ]))
    }
}

/// Everything a joiner needs to enter the new epoch
#[derive(Clone, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Context of the epoch being joined
    pub context: GroupContext,
    /// Leaf slots of that epoch
    pub leaves: Leaves,
    /// Joiner secret of that epoch
    pub joiner_secret: Key32,
    /// Confirmation tag of that epoch (hex)
    pub confirmation_tag: String,
    /// Leaf that signed
    pub signer: u32,
    /// Signature over context, tree and tag (hex)
    pub signature: String,
}

impl GroupInfo {
    pub(crate) fn signed_digest(&self) -> [u8; 32] {
        crypto::hash(&[
            PROTOCOL_LABEL.as_bytes(),
            b"group_info",
            &self.context.digest(),
            self.confirmation_tag.as_bytes(),
            &self.signer.to_be_bytes(),
        ])
    }
}

/// Lets the owner of a key package join a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Welcome {
    /// Reference of the consumed key package
    pub key_package_ref: String,
    /// Ephemeral key the group info is sealed from
    pub sender_key: PublicKey,
    /// NIP-44 sealed [`GroupInfo`]
    pub group_info: String,
}

/// Application ciphertext bound to one epoch and sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationMessage {
    /// Group
    pub group_id: GroupId,
    /// Epoch the message was encrypted under
    pub epoch: u64,
    /// Sender leaf
    pub sender: u32,
    /// Sender ratchet generation
    pub generation: u32,
    /// Base64 AEAD ciphertext of the signed content
    pub ciphertext: String,
}

impl ApplicationMessage {
    pub(crate) fn aad(group_id: &GroupId, epoch: u64, sender: u32, generation: u32) -> [u8; 32] {
        crypto::hash(&[
            PROTOCOL_LABEL.as_bytes(),
            b"application",
            group_id.as_slice(),
            &epoch.to_be_bytes(),
            &sender.to_be_bytes(),
            &generation.to_be_bytes(),
        ])
    }
}

/// Plaintext and sender signature, as sealed inside an [`ApplicationMessage`]
#[derive(Serialize, Deserialize)]
pub(crate) struct SignedContent {
    /// Base64 plaintext
    pub content: String,
    pub signature: String,
}

impl SignedContent {
    pub(crate) fn digest(aad: &[u8; 32], content: &[u8]) -> [u8; 32] {
        crypto::hash(&[aad, content])
    }
}

/// Any protocol message the envelope codec carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum MlsMessage {
    /// Commit
    Commit(Commit),
    /// Welcome
    Welcome(Welcome),
    /// Application message
    Application(ApplicationMessage),
    /// Standalone proposal
    Proposal(ProposalMessage),
}

impl MlsMessage {
    /// Group the message routes to; welcomes deliberately carry none
    pub fn group_id(&self) -> Option<GroupId> {
        match self {
            Self::Commit(c) => Some(c.group_id),
            Self::Application(m) => Some(m.group_id),
            Self::Proposal(p) => Some(p.group_id),
            Self::Welcome(_) => None,
        }
    }

    /// Epoch the message targets
    pub fn epoch(&self) -> Option<u64> {
        match self {
            Self::Commit(c) => Some(c.epoch),
            Self::Application(m) => Some(m.epoch),
            Self::Proposal(p) => Some(p.epoch),
            Self::Welcome(_) => None,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use nostr::Keys;

    use super::*;

    #[test]
    fn test_mls_message_routing_fields() {
        let msg = MlsMessage::Application(ApplicationMessage {
            group_id: GroupId::from_bytes([2; 32]),
            epoch: 7,
            sender: 1,
            generation: 0,
            ciphertext: "AA==".into(),
        });
        assert_eq!(msg.group_id(), Some(GroupId::from_bytes([2; 32])));
        assert_eq!(msg.epoch(), Some(7));

        let welcome = MlsMessage::Welcome(Welcome {
            key_package_ref: "ref".into(),
            sender_key: Keys::generate().public_key(),
            group_info: "sealed".into(),
        });
        assert_eq!(welcome.group_id(), None);
        assert_eq!(MlsMessage::from_bytes(&welcome.to_bytes().unwrap()).unwrap(), welcome);
    }

    #[test]
    fn test_commit_digest_ignores_signature() {
        let mut commit = Commit {
            group_id: GroupId::from_bytes([1; 32]),
            epoch: 0,
            committer: 0,
            proposals: vec![Proposal::Remove { leaf_index: 1 }],
            path: UpdatePath {
                encryption_key: Keys::generate().public_key(),
                sender_key: Keys::generate().public_key(),
                secrets: vec![],
            },
            confirmation_tag: String::new(),
            signature: String::new(),
        };
        let before = commit.content_digest().unwrap();
        commit.signature = "ff".into();
        commit.confirmation_tag = "ee".into();
        assert_eq!(commit.content_digest().unwrap(), before);
        commit.epoch = 1;
        assert_ne!(commit.content_digest().unwrap(), before);
    }
}
