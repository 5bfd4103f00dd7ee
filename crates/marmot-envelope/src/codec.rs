//! Encoding protocol messages as signed Nostr events

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use marmot_group::{KeyPackage, MlsMessage};
use marmot_storage_traits::GroupId;
use nostr::{Event, EventBuilder, EventId, Keys, PublicKey, Tag, Timestamp};
use sha2::{Digest, Sha256};

use crate::EnvelopeConfig;
use crate::error::Error;
use crate::kind::MessageKind;
use crate::tags::{self, EventTags};

/// A message the codec can carry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Commit, proposal, application message or welcome
    Mls(MlsMessage),
    /// Published key package
    KeyPackage(KeyPackage),
}

impl Payload {
    /// Message kind
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Mls(MlsMessage::Commit(_)) => MessageKind::Commit,
            Self::Mls(MlsMessage::Proposal(_)) => MessageKind::Proposal,
            Self::Mls(MlsMessage::Application(_)) => MessageKind::Application,
            Self::Mls(MlsMessage::Welcome(_)) => MessageKind::Welcome,
            Self::KeyPackage(_) => MessageKind::KeyPackage,
        }
    }

    /// Group the message routes to
    pub fn group_id(&self) -> Option<GroupId> {
        match self {
            Self::Mls(m) => m.group_id(),
            Self::KeyPackage(_) => None,
        }
    }

    /// Epoch the message targets
    pub fn epoch(&self) -> Option<u64> {
        match self {
            Self::Mls(m) => m.epoch(),
            Self::KeyPackage(_) => None,
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Mls(m) => Ok(m.to_bytes()?),
            Self::KeyPackage(kp) => Ok(serde_json::to_vec(kp)?),
        }
    }

    fn from_bytes(kind: MessageKind, bytes: &[u8]) -> Result<Self, Error> {
        let payload = match kind {
            MessageKind::KeyPackage => Self::KeyPackage(serde_json::from_slice(bytes)?),
            _ => Self::Mls(MlsMessage::from_bytes(bytes)?),
        };
        if payload.kind() != kind {
            return Err(Error::InvalidTag(format!(
                "`m` tag says {kind}, payload is {}",
                payload.kind()
            )));
        }
        Ok(payload)
    }
}

/// A decoded, fully reassembled message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Id of the event carrying the message, or of its first fragment.
    ///
    /// Commit tie-breaks and the processed-event ledger key on this id.
    pub event_id: EventId,
    /// `created_at` of that event
    pub created_at: Timestamp,
    /// Message id (`x` tag)
    pub message_id: String,
    /// Recipient (welcomes) or owner (key packages)
    pub recipient: Option<PublicKey>,
    /// The message
    pub payload: Payload,
}

impl Envelope {
    /// Message kind
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Group the message routes to
    pub fn group_id(&self) -> Option<GroupId> {
        self.payload.group_id()
    }

    /// Epoch the message targets
    pub fn epoch(&self) -> Option<u64> {
        self.payload.epoch()
    }
}

/// Hex sha256 of the encoded message
pub(crate) fn message_id(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Encode `payload` into one event, or several fragments when it exceeds
/// [`EnvelopeConfig::max_content_bytes`].
///
/// Every event is signed with its own freshly generated key, so events carry no
/// identity. Welcomes must name a `recipient`; key packages are tagged with their
/// owner.
pub fn encode(
    payload: &Payload,
    recipient: Option<&PublicKey>,
    config: &EnvelopeConfig,
) -> Result<Vec<Event>, Error> {
    let kind = payload.kind();
    let recipient = match payload {
        Payload::KeyPackage(kp) => Some(kp.identity),
        Payload::Mls(MlsMessage::Welcome(_)) => Some(*recipient.ok_or(Error::MissingRecipient)?),
        Payload::Mls(_) => recipient.copied(),
    };

    let bytes = payload.to_bytes()?;
    let id = message_id(&bytes);

    let mut base_tags: Vec<Tag> = vec![tags::message_kind(kind), tags::message_id(&id)];
    if let Some(group_id) = payload.group_id() {
        base_tags.push(tags::group(&group_id));
    }
    if let Some(epoch) = payload.epoch() {
        base_tags.push(tags::epoch(epoch));
    }
    if let Some(recipient) = &recipient {
        base_tags.push(tags::recipient(recipient));
    }

    let raw_chunk = config.raw_chunk_size();
    if BASE64.encode(&bytes).len() <= config.max_content_bytes {
        let event = EventBuilder::new(kind.nostr_kind(), BASE64.encode(&bytes))
            .tags(base_tags)
            .sign_with_keys(&Keys::generate())?;
        return Ok(vec![event]);
    }

    let count = bytes.len().div_ceil(raw_chunk) as u32;
    let mut events = Vec::with_capacity(count as usize);
    for (index, chunk) in bytes.chunks(raw_chunk).enumerate() {
        let mut fragment_tags = base_tags.clone();
        fragment_tags.push(tags::fragment(index as u32, count));
        events.push(
            EventBuilder::new(kind.nostr_kind(), BASE64.encode(chunk))
                .tags(fragment_tags)
                .sign_with_keys(&Keys::generate())?,
        );
    }
    tracing::debug!(
        target: "marmot_envelope::codec",
        %kind,
        message_id = %id,
        fragments = count,
        "Chunked oversized message"
    );
    Ok(events)
}

/// One verified event: its tags and decoded content bytes
pub(crate) struct Fragment {
    pub event_id: EventId,
    pub created_at: Timestamp,
    pub tags: EventTags,
    pub bytes: Vec<u8>,
}

impl Fragment {
    pub fn from_event(event: &Event) -> Result<Self, Error> {
        event.verify()?;
        let tags = EventTags::parse(event)?;
        Ok(Self {
            event_id: event.id,
            created_at: event.created_at,
            tags,
            bytes: BASE64.decode(event.content.as_bytes())?,
        })
    }
}

/// Decode a complete message from its ordered content bytes
pub(crate) fn assemble(first: &Fragment, bytes: &[u8]) -> Result<Envelope, Error> {
    let tags = &first.tags;
    if message_id(bytes) != tags.message_id {
        return Err(Error::Integrity(tags.message_id.clone()));
    }
    let payload = Payload::from_bytes(tags.kind, bytes)?;
    if payload.group_id() != tags.group_id {
        return Err(Error::InvalidTag("`h` tag disagrees with payload".to_string()));
    }
    if payload.epoch() != tags.epoch {
        return Err(Error::InvalidTag("`epoch` tag disagrees with payload".to_string()));
    }
    Ok(Envelope {
        event_id: first.event_id,
        created_at: first.created_at,
        message_id: tags.message_id.clone(),
        recipient: tags.recipient,
        payload,
    })
}

/// Decode an unfragmented event. Fragments need a [`crate::Reassembler`].
pub fn decode(event: &Event) -> Result<Envelope, Error> {
    let fragment = Fragment::from_event(event)?;
    if fragment.tags.fragment.is_some() {
        return Err(Error::InvalidTag(
            "fragmented event needs reassembly".to_string(),
        ));
    }
    assemble(&fragment, &fragment.bytes)
}

/// Group an event routes to, read from its tags without decoding the content
pub fn routing_group(event: &Event) -> Result<Option<GroupId>, Error> {
    Ok(EventTags::parse(event)?.group_id)
}
