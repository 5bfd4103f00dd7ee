//! Marmot channel
//!
//! The only surface a host application talks to. A [`MarmotChannel`] maps the
//! host's conversation ids to groups and moves traffic between them and the
//! network:
//!
//! - outbound, [`MarmotChannel::send`] has the sidecar encrypt, encodes the
//!   ciphertext as events and publishes them, returning once a relay acknowledged
//! - inbound, one worker per group feeds events to the sidecar in arrival order
//!   and reports decrypted messages and membership changes as [`ChannelEvent`]s
//! - on startup and after a sidecar restart, each worker replays what it missed
//!   since its persisted watermark, commits first
//!
//! The sidecar launcher and relays are injected through [`RuntimeContext`];
//! nothing is read from global state.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod sessions;
mod worker;

pub use self::channel::MarmotChannel;
pub use self::config::{ChannelConfig, RuntimeContext};
pub use self::error::Error;
pub use self::event::ChannelEvent;
pub use self::sessions::{SessionRecord, SessionStore};
