//! Transport errors

/// Failure of a single relay operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// The relay could not be reached
    #[error("relay {url} unreachable: {reason}")]
    Unreachable {
        /// Relay url
        url: String,
        /// Cause
        reason: String,
    },
    /// The relay answered but refused the event
    #[error("relay {url} rejected event: {reason}")]
    Rejected {
        /// Relay url
        url: String,
        /// Relay message
        reason: String,
    },
    /// No acknowledgement within the publish timeout
    #[error("relay {url} timed out")]
    Timeout {
        /// Relay url
        url: String,
    },
}

/// Transport error
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// No relay acknowledged the event after all retries
    #[error("delivery failed: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    DeliveryFailed(Vec<RelayError>),
    /// No relay accepted the subscription
    #[error("subscription failed: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    SubscribeFailed(Vec<RelayError>),
    /// No relay answered the query
    #[error("fetch failed: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    FetchFailed(Vec<RelayError>),
    /// The transport has no relays configured
    #[error("no relays configured")]
    NoRelays,
}
