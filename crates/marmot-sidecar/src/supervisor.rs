//! Keeps one sidecar running for the host
//!
//! The supervisor launches the sidecar, relaunches it with exponential backoff
//! after it dies, and exposes the engine operations as typed async methods.
//! Requests in flight when the sidecar dies fail with
//! [`Error::SidecarUnavailable`]; they are not retried, since the sidecar may
//! have acted on them before dying.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use marmot_group::{
    ApplicationMessage, Commit, CommitBundle, CommitOutcome, GroupId, GroupSummary, KeyPackage,
    Proposal, ProposalMessage, ProposalReceived, Welcome,
};
use nostr::{EventId, PublicKey};
use tokio::sync::{Mutex, mpsc};

use crate::client::{SidecarClient, SidecarEvent};
use crate::error::Error;
use crate::launcher::{Launcher, SidecarHandle};
use crate::protocol::{Op, Plaintext, Reply, encode_plaintext};

/// Timeouts and restart policy
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use marmot_sidecar::SupervisorConfig;
///
/// let config = SupervisorConfig {
///     max_restarts: 2,
///     ..Default::default()
/// };
/// assert_eq!(config.handshake_timeout, Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Time allowed for the version handshake.
    ///
    /// Default: 5 s
    pub handshake_timeout: Duration,

    /// Time allowed for one request.
    ///
    /// Default: 30 s
    pub request_timeout: Duration,

    /// Launch attempts per outage before the engine is declared down.
    ///
    /// Default: 5
    pub max_restarts: u32,

    /// Delay before the second launch attempt; doubles on every further attempt.
    ///
    /// Default: 200 ms
    pub initial_backoff: Duration,

    /// Upper bound on the launch delay.
    ///
    /// Default: 5 s
    pub max_backoff: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            max_restarts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

struct Running {
    client: SidecarClient,
    handle: SidecarHandle,
}

/// Supervised sidecar
pub struct Supervisor {
    launcher: Arc<dyn Launcher>,
    config: SupervisorConfig,
    current: Mutex<Option<Running>>,
    events: mpsc::UnboundedSender<SidecarEvent>,
    launches: AtomicU32,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("launches", &self.launches.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Launch the first sidecar. The receiver yields engine notifications and
    /// connection changes for as long as the supervisor lives.
    pub async fn start(
        launcher: Arc<dyn Launcher>,
        config: SupervisorConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SidecarEvent>), Error> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            launcher,
            config,
            current: Mutex::new(None),
            events,
            launches: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
        };
        supervisor.ensure_running().await?;
        Ok((supervisor, events_rx))
    }

    /// Number of successful launches so far
    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::Relaxed)
    }

    /// Identity of the running sidecar
    pub async fn identity(&self) -> Result<PublicKey, Error> {
        Ok(self.ensure_running().await?.identity())
    }

    /// Relaunch the sidecar if it is not running
    pub async fn reconnect(&self) -> Result<(), Error> {
        self.ensure_running().await.map(|_| ())
    }

    /// Kill the running sidecar without relaunching it
    pub async fn kill(&self) {
        if let Some(running) = self.current.lock().await.as_mut() {
            tracing::warn!(target: "marmot_sidecar::supervisor", "Killing sidecar");
            running.handle.kill().await;
        }
    }

    /// Ask the sidecar to stop and stop supervising it
    pub async fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let running = self.current.lock().await.take();
        if let Some(running) = running
            && !running.client.is_closed()
            && let Err(e) = running.client.request(Op::Shutdown).await
        {
            tracing::debug!(target: "marmot_sidecar::supervisor", "Shutdown request failed: {e}");
        }
    }

    async fn ensure_running(&self) -> Result<SidecarClient, Error> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::SidecarUnavailable);
        }
        let mut current = self.current.lock().await;
        if let Some(running) = current.as_ref()
            && !running.client.is_closed()
        {
            return Ok(running.client.clone());
        }
        *current = None;

        let restarting = self.launches() > 0;
        let attempts = self.config.max_restarts.max(1);
        let mut backoff = self.config.initial_backoff;
        for attempt in 1..=attempts {
            match self.launch().await {
                Ok(running) => {
                    let client = running.client.clone();
                    *current = Some(running);
                    let launches = self.launches.fetch_add(1, Ordering::Relaxed) + 1;
                    if restarting {
                        tracing::info!(target: "marmot_sidecar::supervisor", launches, "Sidecar restarted");
                        let _ = self.events.send(SidecarEvent::Restarted);
                    }
                    return Ok(client);
                }
                Err(e @ Error::IncompatibleSidecar { .. }) => return Err(e),
                Err(e) => {
                    tracing::warn!(target: "marmot_sidecar::supervisor", attempt, "Sidecar launch failed: {e}");
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(self.config.max_backoff);
                    }
                }
            }
        }
        tracing::error!(target: "marmot_sidecar::supervisor", attempts, "Giving up on sidecar");
        Err(Error::EngineDown { attempts })
    }

    async fn launch(&self) -> Result<Running, Error> {
        let connection = self.launcher.launch().await?;
        let client = SidecarClient::connect(
            connection.reader,
            connection.writer,
            self.events.clone(),
            self.config.handshake_timeout,
            self.config.request_timeout,
        )
        .await?;
        Ok(Running {
            client,
            handle: connection.handle,
        })
    }

    /// Send a raw request
    pub async fn request(&self, op: Op) -> Result<Reply, Error> {
        let client = self.ensure_running().await?;
        let result = client.request(op).await;
        if matches!(result, Err(Error::SidecarUnavailable)) {
            tracing::warn!(target: "marmot_sidecar::supervisor", "Sidecar connection lost during request");
        }
        result
    }

    /// Generate and store a key package
    pub async fn create_key_package(&self) -> Result<KeyPackage, Error> {
        match self.request(Op::CreateKeyPackage).await? {
            Reply::KeyPackage(key_package) => Ok(key_package),
            _ => Err(Error::UnexpectedReply("create_key_package")),
        }
    }

    /// Create a group with the local member alone
    pub async fn create_group(&self) -> Result<GroupSummary, Error> {
        self.group_reply(Op::CreateGroup, "create_group").await
    }

    /// Summary of one group
    pub async fn get_group(&self, group_id: GroupId) -> Result<GroupSummary, Error> {
        self.group_reply(Op::GetGroup { group_id }, "get_group").await
    }

    /// Summaries of every group
    pub async fn list_groups(&self) -> Result<Vec<GroupSummary>, Error> {
        match self.request(Op::ListGroups).await? {
            Reply::Groups(groups) => Ok(groups),
            _ => Err(Error::UnexpectedReply("list_groups")),
        }
    }

    /// Close and erase a group
    pub async fn delete_group(&self, group_id: GroupId) -> Result<GroupSummary, Error> {
        self.group_reply(Op::DeleteGroup { group_id }, "delete_group").await
    }

    /// Stage adding the owner of `key_package`
    pub async fn propose_add(
        &self,
        group_id: GroupId,
        key_package: KeyPackage,
    ) -> Result<Proposal, Error> {
        self.proposal_reply(
            Op::ProposeAdd {
                group_id,
                key_package,
            },
            "propose_add",
        )
        .await
    }

    /// Stage removing the member at `leaf_index`
    pub async fn propose_remove(&self, group_id: GroupId, leaf_index: u32) -> Result<Proposal, Error> {
        self.proposal_reply(
            Op::ProposeRemove {
                group_id,
                leaf_index,
            },
            "propose_remove",
        )
        .await
    }

    /// Stage replacing the local encryption key
    pub async fn propose_update(&self, group_id: GroupId) -> Result<Proposal, Error> {
        self.proposal_reply(Op::ProposeUpdate { group_id }, "propose_update")
            .await
    }

    /// Sign a proposal for the designated committer
    pub async fn sign_proposal(
        &self,
        group_id: GroupId,
        proposal: Proposal,
    ) -> Result<ProposalMessage, Error> {
        match self.request(Op::SignProposal { group_id, proposal }).await? {
            Reply::ProposalMessage(message) => Ok(message),
            _ => Err(Error::UnexpectedReply("sign_proposal")),
        }
    }

    /// Queue a proposal received in `event_id`
    pub async fn receive_proposal(
        &self,
        message: ProposalMessage,
        event_id: EventId,
    ) -> Result<ProposalReceived, Error> {
        match self.request(Op::ReceiveProposal { message, event_id }).await? {
            Reply::ProposalReceived(received) => Ok(received),
            _ => Err(Error::UnexpectedReply("receive_proposal")),
        }
    }

    /// Build a commit over `proposals`
    pub async fn commit(
        &self,
        group_id: GroupId,
        proposals: Vec<Proposal>,
    ) -> Result<CommitBundle, Error> {
        match self.request(Op::Commit { group_id, proposals }).await? {
            Reply::Commit(Some(bundle)) => Ok(bundle),
            _ => Err(Error::UnexpectedReply("commit")),
        }
    }

    /// Commit every proposal received in the current epoch
    pub async fn commit_received(&self, group_id: GroupId) -> Result<Option<CommitBundle>, Error> {
        match self.request(Op::CommitReceived { group_id }).await? {
            Reply::Commit(bundle) => Ok(bundle),
            _ => Err(Error::UnexpectedReply("commit_received")),
        }
    }

    /// Apply a commit received in `event_id`
    pub async fn apply_commit(&self, commit: Commit, event_id: EventId) -> Result<CommitOutcome, Error> {
        match self.request(Op::ApplyCommit { commit, event_id }).await? {
            Reply::CommitApplied(outcome) => Ok(outcome),
            _ => Err(Error::UnexpectedReply("apply_commit")),
        }
    }

    /// Encrypt under the current epoch
    pub async fn encrypt(&self, group_id: GroupId, plaintext: &[u8]) -> Result<ApplicationMessage, Error> {
        let op = Op::Encrypt {
            group_id,
            plaintext: encode_plaintext(plaintext),
        };
        match self.request(op).await? {
            Reply::Encrypted(message) => Ok(message),
            _ => Err(Error::UnexpectedReply("encrypt")),
        }
    }

    /// Decrypt an application message received in `event_id`
    pub async fn decrypt(
        &self,
        message: ApplicationMessage,
        event_id: EventId,
    ) -> Result<Plaintext, Error> {
        match self.request(Op::Decrypt { message, event_id }).await? {
            Reply::Decrypted(plaintext) => Ok(plaintext),
            _ => Err(Error::UnexpectedReply("decrypt")),
        }
    }

    /// Join a group from a welcome received in `event_id`
    pub async fn process_welcome(&self, welcome: Welcome, event_id: EventId) -> Result<GroupSummary, Error> {
        self.group_reply(Op::ProcessWelcome { welcome, event_id }, "process_welcome")
            .await
    }

    async fn group_reply(&self, op: Op, name: &'static str) -> Result<GroupSummary, Error> {
        match self.request(op).await? {
            Reply::Group(summary) => Ok(summary),
            _ => Err(Error::UnexpectedReply(name)),
        }
    }

    async fn proposal_reply(&self, op: Op, name: &'static str) -> Result<Proposal, Error> {
        match self.request(op).await? {
            Reply::Proposal(proposal) => Ok(proposal),
            _ => Err(Error::UnexpectedReply(name)),
        }
    }
}
