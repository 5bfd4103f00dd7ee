//! Channel configuration and injected runtime

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use marmot_envelope::EnvelopeConfig;
use marmot_sidecar::{Launcher, ProcessLauncher, SupervisorConfig};
use marmot_transport::{NostrRelay, Relay, TransportConfig};

use crate::error::Error;

/// Channel configuration
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use marmot_channel::ChannelConfig;
///
/// let config = ChannelConfig::new("/tmp/marmot").relay("wss://relay.example.com");
/// assert_eq!(config.replay_lookback, Duration::from_secs(60));
/// assert_eq!(config.relays.len(), 1);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Relay urls
    pub relays: Vec<String>,
    /// Directory holding the session file and, for a process sidecar, its state
    pub state_dir: PathBuf,
    /// Event encoding
    pub envelope: EnvelopeConfig,
    /// Relay retries and dedup
    pub transport: TransportConfig,
    /// Sidecar timeouts and restarts
    pub supervisor: SupervisorConfig,
    /// Slack subtracted from the replay watermark, since relays order by
    /// `created_at` which senders set themselves.
    ///
    /// Default: 60 s
    pub replay_lookback: Duration,
    /// How long a removed member keeps following the group in case the removing
    /// commit loses its epoch. Match the sidecar's `removal_grace_secs`.
    ///
    /// Default: 600 s
    pub removal_grace: Duration,
}

impl ChannelConfig {
    /// Defaults with state kept in `state_dir` and no relays
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            relays: Vec::new(),
            state_dir: state_dir.into(),
            envelope: EnvelopeConfig::default(),
            transport: TransportConfig::default(),
            supervisor: SupervisorConfig::default(),
            replay_lookback: Duration::from_secs(60),
            removal_grace: Duration::from_secs(600),
        }
    }

    /// Add a relay url
    pub fn relay(mut self, url: impl Into<String>) -> Self {
        self.relays.push(url.into());
        self
    }

    /// Directory handed to a process sidecar
    pub fn sidecar_state_dir(&self) -> PathBuf {
        self.state_dir.join("sidecar")
    }
}

/// What the host injects: how to start the sidecar and which relays to use
#[derive(Clone)]
pub struct RuntimeContext {
    /// Sidecar launcher
    pub launcher: Arc<dyn Launcher>,
    /// Relays
    pub relays: Vec<Arc<dyn Relay>>,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("relays", &self.relays.iter().map(|r| r.url()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl RuntimeContext {
    /// Explicit launcher and relays
    pub fn new(launcher: Arc<dyn Launcher>, relays: Vec<Arc<dyn Relay>>) -> Self {
        Self { launcher, relays }
    }

    /// Run `sidecar_program` as a child process with its state under the
    /// channel's state dir, and connect to every relay in `config`
    pub async fn connect(config: &ChannelConfig, sidecar_program: impl Into<PathBuf>) -> Result<Self, Error> {
        let state_dir = config.sidecar_state_dir();
        let launcher = ProcessLauncher::new(sidecar_program)
            .arg("--state-dir")
            .arg(state_dir.display().to_string())
            .arg("--storage")
            .arg("sqlite");

        let mut relays: Vec<Arc<dyn Relay>> = Vec::with_capacity(config.relays.len());
        for url in &config.relays {
            relays.push(Arc::new(NostrRelay::connect(url).await?));
        }
        Ok(Self::new(Arc::new(launcher), relays))
    }
}
