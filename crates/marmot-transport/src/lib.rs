//! Marmot relay transport
//!
//! Publishes every event to all configured relays at once and counts it delivered
//! as soon as one acknowledges. Subscriptions are opened on every relay and
//! merged, with a bounded window of seen event ids so the same event reaching us
//! through several relays is delivered once.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::time::Duration;

pub mod dedup;
pub mod error;
pub mod memory;
pub mod relay;
pub mod transport;

pub use self::dedup::DedupWindow;
pub use self::error::{Error, RelayError};
pub use self::memory::MemoryRelay;
pub use self::relay::{NostrRelay, Relay};
pub use self::transport::{Subscription, Transport};

/// Retry and dedup settings
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use marmot_transport::TransportConfig;
///
/// let config = TransportConfig {
///     max_attempts: 2,
///     ..Default::default()
/// };
/// assert_eq!(config.initial_backoff, Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Publish attempts per relay before giving up on it.
    ///
    /// Default: 5
    pub max_attempts: u32,

    /// Delay before the first retry; doubles on every further retry.
    ///
    /// Default: 250 ms
    pub initial_backoff: Duration,

    /// Upper bound on the retry delay.
    ///
    /// Default: 8 s
    pub max_backoff: Duration,

    /// Time allowed for one publish attempt.
    ///
    /// Default: 10 s
    pub publish_timeout: Duration,

    /// Number of recent event ids remembered for deduplication.
    ///
    /// Default: 8192
    pub dedup_capacity: usize,

    /// Time allowed for a one-shot query of stored events.
    ///
    /// Default: 10 s
    pub fetch_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
            publish_timeout: Duration::from_secs(10),
            dedup_capacity: 8192,
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }
}
