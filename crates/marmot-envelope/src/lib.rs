//! Marmot envelope codec
//!
//! Maps protocol messages onto Nostr events and back:
//!
//! - key packages travel as kind 443, welcomes as kind 444, and every group message
//!   (commit, proposal, application) as kind 445 told apart by the `m` tag
//! - content is the base64 encoded message
//! - a message larger than [`EnvelopeConfig::max_content_bytes`] is split into
//!   ordered fragments tagged `fragment` = `[index, count]`, which a
//!   [`Reassembler`] puts back together
//!
//! Every event is signed with a throwaway key, so relays learn nothing about
//! which member published it.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::bare_urls)]

use std::time::Duration;

pub mod codec;
pub mod error;
pub mod filters;
pub mod kind;
pub mod reassembly;
mod tags;

pub use self::codec::{Envelope, Payload, decode, encode, routing_group};
pub use self::error::Error;
pub use self::kind::MessageKind;
pub use self::reassembly::Reassembler;

/// Envelope configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeConfig {
    /// Largest event content produced, in bytes of base64 text.
    ///
    /// Default: 32 KiB, well under common relay limits
    pub max_content_bytes: usize,
    /// How long fragments of an incomplete message are buffered.
    ///
    /// Default: 60 seconds
    pub reassembly_timeout: Duration,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            max_content_bytes: 32 * 1024,
            reassembly_timeout: Duration::from_secs(60),
        }
    }
}

impl EnvelopeConfig {
    /// Raw bytes per fragment so its base64 form fits `max_content_bytes`
    pub(crate) fn raw_chunk_size(&self) -> usize {
        (self.max_content_bytes / 4 * 3).max(3)
    }
}
