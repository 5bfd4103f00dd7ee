//! Channel errors

use marmot_sidecar::ErrorCode;
use marmot_storage_traits::GroupId;
use nostr::PublicKey;

/// Error returned to the host
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No relay acknowledged an event of the message
    #[error("delivery failed: {0}")]
    DeliveryFailed(marmot_transport::Error),
    /// Missed commits could not be fetched or applied
    #[error("resync of group {group_id} failed: {reason}")]
    ResyncFailed {
        /// Group
        group_id: GroupId,
        /// Cause
        reason: String,
    },
    /// The sidecar went away while the request was in flight
    #[error("sidecar unavailable")]
    SidecarUnavailable,
    /// The sidecar could not be restarted
    #[error("engine down after {attempts} launch attempts")]
    EngineDown {
        /// Launch attempts made
        attempts: u32,
    },
    /// The conversation has no session
    #[error("unknown conversation {0}")]
    UnknownConversation(String),
    /// The conversation already maps to a group
    #[error("conversation {0} already exists")]
    ConversationExists(String),
    /// The identity is not a member of the group
    #[error("{0} is not a member")]
    UnknownMember(PublicKey),
    /// No key package published for the identity
    #[error("no key package found for {0}")]
    NoKeyPackage(PublicKey),
    /// Any other sidecar failure, including engine refusals
    #[error(transparent)]
    Sidecar(marmot_sidecar::Error),
    /// Encoding or decoding an event
    #[error(transparent)]
    Envelope(#[from] marmot_envelope::Error),
    /// Relay query or subscription
    #[error(transparent)]
    Transport(marmot_transport::Error),
    /// A relay could not be set up
    #[error(transparent)]
    Relay(#[from] marmot_transport::RelayError),
    /// Session file
    #[error("session state: {0}")]
    State(String),
}

impl Error {
    /// Engine error code, when the engine refused the operation
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Sidecar(e) => e.code(),
            _ => None,
        }
    }
}

impl From<marmot_sidecar::Error> for Error {
    fn from(e: marmot_sidecar::Error) -> Self {
        match e {
            marmot_sidecar::Error::SidecarUnavailable => Self::SidecarUnavailable,
            marmot_sidecar::Error::EngineDown { attempts } => Self::EngineDown { attempts },
            other => Self::Sidecar(other),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::State(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::State(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use marmot_sidecar::WireError;

    use super::*;

    #[test]
    fn test_sidecar_outages_keep_their_names() {
        assert!(matches!(
            Error::from(marmot_sidecar::Error::SidecarUnavailable),
            Error::SidecarUnavailable
        ));
        assert!(matches!(
            Error::from(marmot_sidecar::Error::EngineDown { attempts: 3 }),
            Error::EngineDown { attempts: 3 }
        ));
    }

    #[test]
    fn test_engine_refusals_expose_their_code() {
        let refused = Error::from(marmot_sidecar::Error::Engine(WireError::new(
            ErrorCode::GroupClosed,
            "group is closed",
        )));
        assert_eq!(refused.code(), Some(ErrorCode::GroupClosed));
        assert_eq!(Error::SidecarUnavailable.code(), None);
    }
}
