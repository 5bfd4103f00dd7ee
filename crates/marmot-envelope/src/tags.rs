//! Tag conventions
//!
//! | tag | value |
//! |---|---|
//! | `h` | group id (hex) |
//! | `epoch` | decimal epoch |
//! | `m` | [`MessageKind`] |
//! | `x` | sha256 (hex) of the encoded message |
//! | `fragment` | `index`, `count`; only on chunked messages |
//! | `p` | welcome recipient, or key package owner |

use marmot_storage_traits::GroupId;
use nostr::{Event, PublicKey, Tag, TagKind};

use crate::error::Error;
use crate::kind::MessageKind;

pub(crate) const EPOCH: &str = "epoch";
pub(crate) const MESSAGE_KIND: &str = "m";
pub(crate) const MESSAGE_ID: &str = "x";
pub(crate) const FRAGMENT: &str = "fragment";

pub(crate) fn group(group_id: &GroupId) -> Tag {
    Tag::custom(TagKind::h(), [group_id.to_hex()])
}

pub(crate) fn epoch(epoch: u64) -> Tag {
    Tag::custom(TagKind::custom(EPOCH), [epoch.to_string()])
}

pub(crate) fn message_kind(kind: MessageKind) -> Tag {
    Tag::custom(TagKind::custom(MESSAGE_KIND), [kind.as_str()])
}

pub(crate) fn message_id(id: &str) -> Tag {
    Tag::custom(TagKind::custom(MESSAGE_ID), [id])
}

pub(crate) fn fragment(index: u32, count: u32) -> Tag {
    Tag::custom(
        TagKind::custom(FRAGMENT),
        [index.to_string(), count.to_string()],
    )
}

pub(crate) fn recipient(public_key: &PublicKey) -> Tag {
    Tag::public_key(*public_key)
}

/// Marmot tags read from one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EventTags {
    pub kind: MessageKind,
    pub message_id: String,
    pub group_id: Option<GroupId>,
    pub epoch: Option<u64>,
    pub recipient: Option<PublicKey>,
    /// `(index, count)`
    pub fragment: Option<(u32, u32)>,
}

impl EventTags {
    pub fn parse(event: &Event) -> Result<Self, Error> {
        let mut kind = None;
        let mut message_id = None;
        let mut group_id = None;
        let mut epoch = None;
        let mut recipient = None;
        let mut fragment = None;

        for tag in event.tags.iter() {
            match tag.as_slice() {
                [name, value, ..] if name == "h" => {
                    group_id = Some(
                        GroupId::from_hex(value)
                            .map_err(|e| Error::InvalidTag(format!("h: {e}")))?,
                    );
                }
                [name, value, ..] if name == EPOCH => {
                    epoch = Some(
                        value
                            .parse::<u64>()
                            .map_err(|e| Error::InvalidTag(format!("epoch: {e}")))?,
                    );
                }
                [name, value, ..] if name == MESSAGE_KIND => kind = Some(value.parse()?),
                [name, value, ..] if name == MESSAGE_ID => message_id = Some(value.clone()),
                [name, index, count, ..] if name == FRAGMENT => {
                    let index: u32 = index
                        .parse()
                        .map_err(|e| Error::InvalidTag(format!("fragment index: {e}")))?;
                    let count: u32 = count
                        .parse()
                        .map_err(|e| Error::InvalidTag(format!("fragment count: {e}")))?;
                    if count == 0 || index >= count {
                        return Err(Error::InvalidTag(format!("fragment {index} of {count}")));
                    }
                    fragment = Some((index, count));
                }
                [name, value, ..] if name == "p" => {
                    recipient = Some(
                        PublicKey::from_hex(value)
                            .map_err(|e| Error::InvalidTag(format!("p: {e}")))?,
                    );
                }
                _ => {}
            }
        }

        let kind: MessageKind = kind.ok_or(Error::MissingTag(MESSAGE_KIND))?;
        if kind.nostr_kind() != event.kind {
            return Err(Error::InvalidTag(format!(
                "{kind} does not travel as kind {}",
                event.kind.as_u16()
            )));
        }
        if kind.is_group_message() {
            if group_id.is_none() {
                return Err(Error::MissingTag("h"));
            }
            if epoch.is_none() {
                return Err(Error::MissingTag(EPOCH));
            }
        }

        Ok(Self {
            kind,
            message_id: message_id.ok_or(Error::MissingTag(MESSAGE_ID))?,
            group_id,
            epoch,
            recipient,
            fragment,
        })
    }
}
