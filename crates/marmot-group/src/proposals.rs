//! Proposals and their signed carrier message

use marmot_storage_traits::GroupId;
use nostr::{Keys, PublicKey};
use serde::{Deserialize, Serialize};

use crate::constant::PROTOCOL_LABEL;
use crate::crypto;
use crate::error::Error;
use crate::key_packages::KeyPackage;

/// A membership or key change staged for the next commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Proposal {
    /// Add the owner of a key package
    Add {
        /// Key package of the new member
        key_package: KeyPackage,
    },
    /// Remove the member at a leaf
    Remove {
        /// Leaf to blank
        leaf_index: u32,
    },
    /// Replace a member's encryption key
    Update {
        /// Leaf updating its key
        leaf_index: u32,
        /// New encryption key
        encryption_key: PublicKey,
    },
}

impl Proposal {
    /// Ordering bucket when applied inside a commit: updates, removes, then adds
    pub(crate) fn apply_order(&self) -> u8 {
        match self {
            Self::Update { .. } => 0,
            Self::Remove { .. } => 1,
            Self::Add { .. } => 2,
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A proposal sent by a member that is not committing it itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalMessage {
    /// Group
    pub group_id: GroupId,
    /// Epoch the proposal was made in
    pub epoch: u64,
    /// Sender leaf
    pub sender: u32,
    /// The proposal
    pub proposal: Proposal,
    /// Sender identity signature (hex)
    pub signature: String,
}

impl ProposalMessage {
    fn signed_digest(
        group_id: &GroupId,
        epoch: u64,
        sender: u32,
        proposal: &Proposal,
    ) -> Result<[u8; 32], Error> {
        Ok(crypto::hash(&[
            PROTOCOL_LABEL.as_bytes(),
            b"proposal",
            group_id.as_slice(),
            &epoch.to_be_bytes(),
            &sender.to_be_bytes(),
            &proposal.encode()?,
        ]))
    }

    /// Sign a proposal as `sender`
    pub(crate) fn sign(
        keys: &Keys,
        group_id: GroupId,
        epoch: u64,
        sender: u32,
        proposal: Proposal,
    ) -> Result<Self, Error> {
        let digest = Self::signed_digest(&group_id, epoch, sender, &proposal)?;
        Ok(Self {
            group_id,
            epoch,
            sender,
            signature: crypto::sign(keys, &digest)?,
            proposal,
        })
    }

    /// Verify against the sender's identity key
    pub(crate) fn verify(&self, identity: &PublicKey) -> Result<(), Error> {
        let digest = Self::signed_digest(&self.group_id, self.epoch, self.sender, &self.proposal)?;
        crypto::verify(identity, &digest, &self.signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proposal_message_signature() {
        let keys = Keys::generate();
        let msg = ProposalMessage::sign(
            &keys,
            GroupId::from_bytes([1; 32]),
            3,
            0,
            Proposal::Remove { leaf_index: 2 },
        )
        .unwrap();
        msg.verify(&keys.public_key()).unwrap();

        let mut forged = msg.clone();
        forged.proposal = Proposal::Remove { leaf_index: 1 };
        assert!(forged.verify(&keys.public_key()).is_err());
    }

    #[test]
    fn test_proposal_serde_tag() {
        let json = serde_json::to_string(&Proposal::Remove { leaf_index: 4 }).unwrap();
        assert_eq!(json, r#"{"type":"remove","leaf_index":4}"#);
    }
}
