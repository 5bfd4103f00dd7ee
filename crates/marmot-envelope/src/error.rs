//! Envelope errors

/// Envelope codec error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Event error
    #[error(transparent)]
    Event(#[from] nostr::event::Error),
    /// Event builder error
    #[error(transparent)]
    Builder(#[from] nostr::event::builder::Error),
    /// Group message error
    #[error(transparent)]
    Group(#[from] marmot_group::Error),
    /// A fragmented message did not complete within the reassembly window
    #[error("incomplete message {message_id}: {received} of {expected} fragments arrived")]
    IncompleteMessage {
        /// Message id (`x` tag)
        message_id: String,
        /// Fragments received
        received: u32,
        /// Fragments expected
        expected: u32,
    },
    /// The event is not a Marmot event
    #[error("unexpected event kind {0}")]
    UnexpectedKind(u16),
    /// A required tag is missing
    #[error("missing `{0}` tag")]
    MissingTag(&'static str),
    /// A tag is malformed or disagrees with the payload
    #[error("invalid tag: {0}")]
    InvalidTag(String),
    /// Welcomes need a recipient
    #[error("welcome requires a recipient")]
    MissingRecipient,
    /// Reassembled payload does not hash to its message id
    #[error("payload does not match message id {0}")]
    Integrity(String),
    /// Content could not be decoded
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}
