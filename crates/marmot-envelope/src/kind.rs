//! Closed set of message kinds carried over Nostr

use std::fmt;
use std::str::FromStr;

use nostr::Kind;

use crate::error::Error;

/// What an event carries. The `m` tag names it; the Nostr kind groups it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Commit advancing a group by one epoch
    Commit,
    /// Proposal sent to the designated committer
    Proposal,
    /// Encrypted application message
    Application,
    /// Welcome for a newly added member
    Welcome,
    /// Published key package
    KeyPackage,
}

impl MessageKind {
    /// Every kind, in wire order
    pub const ALL: [Self; 5] = [
        Self::Commit,
        Self::Proposal,
        Self::Application,
        Self::Welcome,
        Self::KeyPackage,
    ];

    /// Value of the `m` tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Proposal => "proposal",
            Self::Application => "application",
            Self::Welcome => "welcome",
            Self::KeyPackage => "key_package",
        }
    }

    /// Nostr event kind used to publish this message kind
    pub fn nostr_kind(&self) -> Kind {
        match self {
            Self::KeyPackage => Kind::MlsKeyPackage,
            Self::Welcome => Kind::MlsWelcome,
            Self::Commit | Self::Proposal | Self::Application => Kind::MlsGroupMessage,
        }
    }

    /// Whether the message belongs to a group and carries `h`/`epoch` tags
    pub fn is_group_message(&self) -> bool {
        self.nostr_kind() == Kind::MlsGroupMessage
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::InvalidTag(format!("unknown message kind: {s}")))
    }
}
