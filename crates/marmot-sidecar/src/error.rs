//! Host-side errors

use std::time::Duration;

use crate::protocol::WireError;

/// Error seen by the host when talking to the sidecar
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The sidecar went away before answering
    #[error("sidecar unavailable")]
    SidecarUnavailable,
    /// The sidecar speaks another protocol version
    #[error("incompatible sidecar: host speaks protocol {expected}, sidecar speaks {found}")]
    IncompatibleSidecar {
        /// Host version
        expected: u32,
        /// Sidecar version
        found: u32,
    },
    /// No `Ready` within the handshake timeout
    #[error("sidecar handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    /// No response within the request timeout
    #[error("sidecar did not answer {op} within {timeout:?}")]
    RequestTimeout {
        /// Operation name
        op: &'static str,
        /// Timeout applied
        timeout: Duration,
    },
    /// Every restart attempt failed
    #[error("engine down after {attempts} launch attempts")]
    EngineDown {
        /// Attempts made
        attempts: u32,
    },
    /// The sidecar could not be started
    #[error("sidecar launch failed: {0}")]
    Launch(String),
    /// The engine refused the operation
    #[error("engine error: {0}")]
    Engine(#[from] WireError),
    /// The sidecar answered with a reply of the wrong type
    #[error("unexpected reply to {0}")]
    UnexpectedReply(&'static str),
}

impl Error {
    /// Code of an engine error, if this is one
    pub fn code(&self) -> Option<crate::protocol::ErrorCode> {
        match self {
            Self::Engine(e) => Some(e.code),
            _ => None,
        }
    }
}
