//! Leaf slots of a group
//!
//! Members occupy numbered leaves. A removed member leaves a blank slot that the
//! next add fills (leftmost blank first), so surviving members keep their index.

use nostr::PublicKey;
use serde::{Deserialize, Serialize};

use crate::constant::{MAX_GROUP_SIZE, PROTOCOL_LABEL};
use crate::crypto;
use crate::error::Error;

/// A group member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Identity key
    pub identity: PublicKey,
    /// Leaf index
    pub leaf_index: u32,
    /// Key commit secrets are sealed to
    pub encryption_key: PublicKey,
    /// Capability flags from the member's key package
    pub capabilities: Vec<String>,
}

/// Ordered leaf slots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Leaves(Vec<Option<Member>>);

impl Leaves {
    /// Single-member tree
    pub fn single(member: Member) -> Self {
        Self(vec![Some(member)])
    }

    /// Member at `leaf_index`
    pub fn get(&self, leaf_index: u32) -> Option<&Member> {
        self.0.get(leaf_index as usize).and_then(|slot| slot.as_ref())
    }

    /// Mutable member at `leaf_index`
    pub fn get_mut(&mut self, leaf_index: u32) -> Option<&mut Member> {
        self.0
            .get_mut(leaf_index as usize)
            .and_then(|slot| slot.as_mut())
    }

    /// Active members in leaf order
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.0.iter().flatten()
    }

    /// Number of active members
    pub fn len(&self) -> usize {
        self.members().count()
    }

    /// True if no member is active
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Leaf of the first active member with `identity`
    pub fn find_identity(&self, identity: &PublicKey) -> Option<&Member> {
        self.members().find(|m| &m.identity == identity)
    }

    /// Put a member in the leftmost blank slot and return its index.
    pub fn add(
        &mut self,
        identity: PublicKey,
        encryption_key: PublicKey,
        capabilities: Vec<String>,
    ) -> Result<u32, Error> {
        let index = match self.0.iter().position(Option::is_none) {
            Some(blank) => blank,
            None if self.0.len() < MAX_GROUP_SIZE => {
                self.0.push(None);
                self.0.len() - 1
            }
            None => {
                return Err(Error::InvalidProposal(format!(
                    "group is full ({MAX_GROUP_SIZE} leaves)"
                )));
            }
        };
        let leaf_index = index as u32;
        self.0[index] = Some(Member {
            identity,
            leaf_index,
            encryption_key,
            capabilities,
        });
        Ok(leaf_index)
    }

    /// Blank a slot, returning the removed member.
    pub fn remove(&mut self, leaf_index: u32) -> Option<Member> {
        let removed = self.0.get_mut(leaf_index as usize)?.take();
        // keep the vector tight so equal memberships hash equally
        while matches!(self.0.last(), Some(None)) {
            self.0.pop();
        }
        removed
    }

    /// Hash binding the full membership and every leaf key
    pub fn tree_hash(&self) -> Result<[u8; 32], Error> {
        let encoded = serde_json::to_vec(&self.0)?;
        Ok(crypto::hash(&[PROTOCOL_LABEL.as_bytes(), b"tree", &encoded]))
    }
}
