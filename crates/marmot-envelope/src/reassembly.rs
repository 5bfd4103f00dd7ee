//! Fragment reassembly
//!
//! Fragments of one message share its `x` tag. A message is released once every
//! index `0..count` has arrived; a partial buffer older than the reassembly
//! timeout is discarded and reported as [`Error::IncompleteMessage`].
//!
//! Anyone can sign an event carrying a known `x` tag, so nothing a single
//! fragment says is trusted on its own. Fragments that disagree on kind or count
//! go to separate buffers, and an index may hold a few competing candidates. A
//! message is released only for a combination whose bytes hash to the `x` tag.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use crate::EnvelopeConfig;
use crate::codec::{self, Envelope, Fragment};
use crate::error::Error;
use crate::kind::MessageKind;

/// Competing fragments kept for one index
const MAX_CANDIDATES_PER_INDEX: usize = 4;
/// Combinations tried before giving up on a complete buffer
const MAX_ASSEMBLY_ATTEMPTS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PartialKey {
    message_id: String,
    kind: MessageKind,
    count: u32,
}

struct Partial {
    first_seen: Instant,
    fragments: BTreeMap<u32, Vec<Fragment>>,
}

impl Partial {
    /// Try candidate combinations, index 0 first, until one hashes to the message id
    fn assemble(&self, count: u32) -> Result<Envelope, Error> {
        let slots: Vec<&Vec<Fragment>> = self.fragments.values().collect();
        let mut choice = vec![0usize; slots.len()];
        let mut last_error = Error::InvalidTag(format!("no fragments for {count} slots"));

        for _ in 0..MAX_ASSEMBLY_ATTEMPTS {
            let mut bytes = Vec::new();
            for (slot, &pick) in slots.iter().zip(&choice) {
                bytes.extend_from_slice(&slot[pick].bytes);
            }
            match codec::assemble(&slots[0][choice[0]], &bytes) {
                Ok(envelope) => return Ok(envelope),
                Err(e) => last_error = e,
            }

            // next combination, last index varying fastest
            let mut position = slots.len();
            loop {
                if position == 0 {
                    return Err(last_error);
                }
                position -= 1;
                choice[position] += 1;
                if choice[position] < slots[position].len() {
                    break;
                }
                choice[position] = 0;
            }
        }
        Err(last_error)
    }
}

/// Buffers fragments until their message is complete
pub struct Reassembler {
    config: EnvelopeConfig,
    pending: HashMap<PartialKey, Partial>,
}

impl std::fmt::Debug for Reassembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reassembler")
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Reassembler {
    /// New reassembler
    pub fn new(config: EnvelopeConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
        }
    }

    /// Number of messages with fragments buffered
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Feed one event. Returns the message once it is complete.
    pub fn push(&mut self, event: &nostr::Event) -> Result<Option<Envelope>, Error> {
        self.push_at(event, Instant::now())
    }

    /// [`Reassembler::push`] with an explicit clock.
    ///
    /// A complete buffer that fails to assemble is kept, so a genuine fragment
    /// arriving later can still complete it before the timeout.
    pub fn push_at(&mut self, event: &nostr::Event, now: Instant) -> Result<Option<Envelope>, Error> {
        let fragment = Fragment::from_event(event)?;
        let Some((index, count)) = fragment.tags.fragment else {
            return codec::assemble(&fragment, &fragment.bytes).map(Some);
        };

        let key = PartialKey {
            message_id: fragment.tags.message_id.clone(),
            kind: fragment.tags.kind,
            count,
        };
        let partial = self.pending.entry(key.clone()).or_insert_with(|| Partial {
            first_seen: now,
            fragments: BTreeMap::new(),
        });
        let candidates = partial.fragments.entry(index).or_default();
        if candidates
            .iter()
            .any(|c| c.bytes == fragment.bytes && c.tags == fragment.tags)
        {
            return Ok(None);
        }
        if candidates.len() >= MAX_CANDIDATES_PER_INDEX {
            tracing::warn!(
                target: "marmot_envelope::reassembly",
                message_id = %key.message_id,
                index,
                "Too many competing fragments, dropping one"
            );
            return Ok(None);
        }
        candidates.push(fragment);

        if partial.fragments.len() < count as usize {
            return Ok(None);
        }
        match partial.assemble(count) {
            Ok(envelope) => {
                self.pending.remove(&key);
                Ok(Some(envelope))
            }
            Err(e) => {
                tracing::debug!(
                    target: "marmot_envelope::reassembly",
                    message_id = %key.message_id,
                    "No fragment combination assembles yet: {e}"
                );
                Err(e)
            }
        }
    }

    /// Drop partial messages older than the reassembly timeout
    pub fn expire(&mut self) -> Vec<Error> {
        self.expire_at(Instant::now())
    }

    /// [`Reassembler::expire`] with an explicit clock
    pub fn expire_at(&mut self, now: Instant) -> Vec<Error> {
        let timeout = self.config.reassembly_timeout;
        let mut expired = Vec::new();
        self.pending.retain(|key, partial| {
            if now.saturating_duration_since(partial.first_seen) < timeout {
                return true;
            }
            tracing::warn!(
                target: "marmot_envelope::reassembly",
                message_id = %key.message_id,
                received = partial.fragments.len(),
                expected = key.count,
                "Discarding incomplete message"
            );
            expired.push(Error::IncompleteMessage {
                message_id: key.message_id.clone(),
                received: partial.fragments.len() as u32,
                expected: key.count,
            });
            false
        });
        expired
    }
}
