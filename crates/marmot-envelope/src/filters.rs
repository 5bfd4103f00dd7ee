//! Relay filters matching the tag conventions

use marmot_storage_traits::GroupId;
use nostr::{Alphabet, Filter, Kind, PublicKey, SingleLetterTag, Timestamp};

/// Group messages (commits, proposals, application messages) for `group_ids`
pub fn group_messages<'a, I>(group_ids: I, since: Option<Timestamp>) -> Filter
where
    I: IntoIterator<Item = &'a GroupId>,
{
    let filter = Filter::new()
        .kind(Kind::MlsGroupMessage)
        .custom_tags(
            SingleLetterTag::lowercase(Alphabet::H),
            group_ids.into_iter().map(|id| id.to_hex()),
        );
    match since {
        Some(since) => filter.since(since),
        None => filter,
    }
}

/// Welcomes addressed to `recipient`
pub fn welcomes(recipient: &PublicKey, since: Option<Timestamp>) -> Filter {
    let filter = Filter::new()
        .kind(Kind::MlsWelcome)
        .custom_tag(SingleLetterTag::lowercase(Alphabet::P), recipient.to_hex());
    match since {
        Some(since) => filter.since(since),
        None => filter,
    }
}

/// Key packages published for `owner`
pub fn key_packages(owner: &PublicKey) -> Filter {
    Filter::new()
        .kind(Kind::MlsKeyPackage)
        .custom_tag(SingleLetterTag::lowercase(Alphabet::P), owner.to_hex())
}
