//! Per-sender hash ratchets
//!
//! Each member of an epoch owns a chain seeded from the epoch's encryption secret
//! and its leaf index. Generation `g` of the chain yields one AEAD key and nonce;
//! the chain then advances, so a key is usable exactly once.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{self, Key32};
use crate::error::Error;

/// Key and nonce for one message
pub struct MessageKey {
    pub(crate) key: Key32,
    pub(crate) nonce: [u8; 12],
}

/// One sender's chain
#[derive(Clone, Serialize, Deserialize)]
pub struct SenderRatchet {
    next_generation: u32,
    chain: Key32,
    /// Chain secrets of generations skipped over, kept for out-of-order delivery
    skipped: BTreeMap<u32, Key32>,
}

impl fmt::Debug for SenderRatchet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderRatchet")
            .field("next_generation", &self.next_generation)
            .field("skipped", &self.skipped.len())
            .finish_non_exhaustive()
    }
}

impl SenderRatchet {
    /// Chain of `leaf_index` under an epoch encryption secret
    pub fn new(encryption_secret: &[u8; 32], leaf_index: u32) -> Result<Self, Error> {
        Ok(Self {
            next_generation: 0,
            chain: crypto::expand(encryption_secret, "sender", &leaf_index.to_be_bytes())?,
            skipped: BTreeMap::new(),
        })
    }

    /// Generation the next call to [`SenderRatchet::next`] returns
    pub fn next_generation(&self) -> u32 {
        self.next_generation
    }

    fn message_key(chain: &Key32) -> Result<MessageKey, Error> {
        let key = crypto::expand(chain.expose(), "key", b"")?;
        let nonce_material = crypto::expand(chain.expose(), "nonce", b"")?;
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&nonce_material.expose()[..12]);
        Ok(MessageKey { key, nonce })
    }

    fn advance(&mut self) -> Result<(), Error> {
        self.chain = crypto::expand(self.chain.expose(), "next", b"")?;
        self.next_generation = self
            .next_generation
            .checked_add(1)
            .ok_or_else(|| Error::Crypto("sender ratchet exhausted".to_string()))?;
        Ok(())
    }

    /// Sending side: key for the next generation
    pub fn next(&mut self) -> Result<(u32, MessageKey), Error> {
        let generation = self.next_generation;
        let key = Self::message_key(&self.chain)?;
        self.advance()?;
        Ok((generation, key))
    }

    /// Receiving side: key for `generation`, consuming it.
    ///
    /// Generations behind the chain head are served from the skipped set at most
    /// once. Jumping ahead stores the skipped chain secrets, keeping at most
    /// `tolerance` of them (oldest dropped first).
    pub fn key_for(
        &mut self,
        generation: u32,
        tolerance: u32,
        maximum_forward_distance: u32,
    ) -> Result<MessageKey, Error> {
        if generation < self.next_generation {
            let chain = self.skipped.remove(&generation).ok_or_else(|| {
                Error::AuthenticationFailure(format!(
                    "key for generation {generation} already used or expired"
                ))
            })?;
            return Self::message_key(&chain);
        }

        let distance = generation - self.next_generation;
        if distance > maximum_forward_distance {
            return Err(Error::AuthenticationFailure(format!(
                "generation {generation} is {distance} ahead of the chain"
            )));
        }

        while self.next_generation < generation {
            self.skipped
                .insert(self.next_generation, self.chain.clone());
            self.advance()?;
        }
        let key = Self::message_key(&self.chain)?;
        self.advance()?;

        while self.skipped.len() > tolerance as usize {
            self.skipped.pop_first();
        }
        Ok(key)
    }
}
