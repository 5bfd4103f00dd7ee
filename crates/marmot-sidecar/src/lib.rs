//! Marmot sidecar
//!
//! All group key material lives in the sidecar. The host reaches the engine only
//! through framed requests over a private pipe: the child process's stdin and
//! stdout, or an in-memory duplex when the sidecar runs in-process.
//!
//! - [`daemon::serve`] is the sidecar side: it answers the handshake and runs
//!   requests against a [`marmot_group::MarmotEngine`].
//! - [`Supervisor`] is the host side: it launches the sidecar through a
//!   [`Launcher`], relaunches it with backoff after a crash and exposes typed
//!   engine operations.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod codec;
pub mod daemon;
pub mod error;
pub mod identity;
pub mod launcher;
pub mod protocol;
pub mod supervisor;

pub use self::client::{SidecarClient, SidecarEvent};
pub use self::error::Error;
pub use self::launcher::{Connection, InProcessLauncher, Launcher, ProcessLauncher, SidecarHandle};
pub use self::protocol::{ErrorCode, Notification, PROTOCOL_VERSION, Plaintext, WireError};
pub use self::supervisor::{Supervisor, SupervisorConfig};
