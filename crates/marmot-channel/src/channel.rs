//! The host-facing channel

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use marmot_envelope::{EnvelopeConfig, Payload, Reassembler, decode, encode, filters, routing_group};
use marmot_group::{CommitBundle, CommitOutcome, GroupSummary, KeyPackage, MlsMessage};
use marmot_sidecar::{ErrorCode, SidecarEvent, Supervisor};
use marmot_storage_traits::GroupId;
use marmot_storage_traits::groups::GroupLifecycle;
use marmot_transport::{Subscription, Transport};
use nostr::{Event, EventId, Kind, PublicKey, Timestamp};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{ChannelConfig, RuntimeContext};
use crate::error::Error;
use crate::event::ChannelEvent;
use crate::sessions::{SessionRecord, SessionStore};
use crate::worker::{self, Inbound, WorkerHandle};

/// How often the welcome task expires fragments and reopens a lost subscription
const WELCOME_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

/// State shared by the channel, its group workers and its background tasks
pub(crate) struct Shared {
    pub(crate) supervisor: Supervisor,
    pub(crate) transport: Transport,
    pub(crate) sessions: SessionStore,
    pub(crate) envelope: EnvelopeConfig,
    pub(crate) replay_lookback: Duration,
    removal_grace: Duration,
    identity: PublicKey,
    events: mpsc::UnboundedSender<ChannelEvent>,
    welcomes: mpsc::UnboundedSender<Event>,
    workers: Mutex<HashMap<GroupId, WorkerHandle>>,
}

impl Shared {
    pub(crate) fn emit(&self, event: ChannelEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!(target: "marmot_channel", "Host dropped the event receiver");
        }
    }

    pub(crate) fn record_epoch(&self, group_id: &GroupId, epoch: u64) {
        if let Err(e) = self.sessions.set_epoch(group_id, epoch) {
            tracing::warn!(target: "marmot_channel", "Failed to persist session: {e}");
        }
    }

    /// Publish every event of one message; fails on the first undelivered event
    async fn publish_all(&self, events: &[Event]) -> Result<(), Error> {
        for event in events {
            self.transport
                .publish(event)
                .await
                .map_err(Error::DeliveryFailed)?;
        }
        Ok(())
    }

    /// Publish a staged commit, apply it locally under its event id, then send
    /// the welcomes. A competing commit that won the epoch surfaces as a
    /// `CommitConflict` engine error; the caller re-proposes against the new epoch.
    /// A winner that arrives after the local apply rolls the commit back and is
    /// reported as [`ChannelEvent::CommitRolledBack`].
    pub(crate) async fn publish_commit(&self, bundle: CommitBundle) -> Result<CommitOutcome, Error> {
        let group_id = bundle.group_id;
        let events = encode(
            &Payload::Mls(MlsMessage::Commit(bundle.commit.clone())),
            None,
            &self.envelope,
        )?;
        let Some(first) = events.first() else {
            return Err(Error::State("commit encoded to no events".to_string()));
        };
        let (event_id, created_at) = (first.id, first.created_at);
        self.publish_all(&events).await?;

        let outcome = self.supervisor.apply_commit(bundle.commit, event_id).await?;
        if let Err(e) = self.sessions.mark_handled(&group_id, event_id, created_at) {
            tracing::warn!(target: "marmot_channel", "Failed to persist session: {e}");
        }
        self.record_epoch(&group_id, outcome.epoch);
        tracing::info!(target: "marmot_channel", epoch = outcome.epoch, %event_id, "Commit published");

        let mut undelivered = None;
        for (recipient, welcome) in bundle.welcomes {
            let events = encode(&Payload::Mls(MlsMessage::Welcome(welcome)), Some(&recipient), &self.envelope)?;
            if let Err(e) = self.publish_all(&events).await {
                tracing::warn!(target: "marmot_channel", %recipient, "Welcome not delivered: {e}");
                undelivered.get_or_insert(e);
            }
        }
        match undelivered {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    fn spawn_worker(self: &Arc<Self>, group_id: GroupId) {
        let mut workers = self.workers.lock();
        if workers.get(&group_id).is_some_and(|w| !w.is_finished()) {
            return;
        }
        workers.insert(group_id, worker::spawn(Arc::clone(self), group_id));
    }

    /// Stop a group's worker; `true` if one was running
    fn stop_worker(&self, group_id: &GroupId) -> bool {
        self.workers.lock().remove(group_id).is_some()
    }

    /// Keep a removed member's worker through the grace period, so a winning
    /// commit can still reinstate it, then stop it unless that happened
    fn retire_after_grace(self: &Arc<Self>, group_id: GroupId) {
        let shared = Arc::downgrade(self);
        let grace = self.removal_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let still_closed = match shared.supervisor.get_group(group_id).await {
                Ok(summary) => summary.lifecycle == GroupLifecycle::Closed,
                Err(e) if e.code() == Some(ErrorCode::GroupNotFound) => true,
                Err(e) => {
                    tracing::debug!(target: "marmot_channel", ?group_id, "Removed group not checked: {e}");
                    false
                }
            };
            if still_closed && shared.stop_worker(&group_id) {
                tracing::info!(target: "marmot_channel", ?group_id, "Removal final, worker stopped");
            }
        });
    }

    /// Session and worker for a group joined from a welcome
    fn joined(self: &Arc<Self>, summary: GroupSummary, welcome_created_at: Timestamp) -> Result<(), Error> {
        let group_id = summary.group_id;
        let conversation_id = group_id.to_hex();
        self.sessions
            .insert(SessionRecord::new(&conversation_id, group_id, summary.epoch))?;
        self.sessions.start_watermark(&group_id, welcome_created_at)?;
        self.emit(ChannelEvent::Joined {
            conversation_id,
            group_id,
            epoch: summary.epoch,
            members: summary.members.iter().map(|m| m.identity).collect(),
        });
        self.spawn_worker(group_id);
        Ok(())
    }

    async fn on_welcome_event(self: &Arc<Self>, reassembler: &mut Reassembler, event: &Event) {
        let envelope = match reassembler.push(event) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!(target: "marmot_channel", event_id = %event.id, "Dropping undecodable welcome: {e}");
                return;
            }
        };
        let Payload::Mls(MlsMessage::Welcome(welcome)) = envelope.payload else {
            return;
        };
        if envelope.recipient != Some(self.identity) {
            return;
        }

        match self.supervisor.process_welcome(welcome, envelope.event_id).await {
            Ok(summary) => {
                tracing::info!(target: "marmot_channel", epoch = summary.epoch, "Joined group");
                if let Err(e) = self.joined(summary, envelope.created_at) {
                    tracing::warn!(target: "marmot_channel", "Failed to open session for joined group: {e}");
                }
            }
            Err(e) => match e.code() {
                Some(ErrorCode::AlreadyProcessed) => {}
                Some(ErrorCode::UnknownWelcome) => {
                    tracing::debug!(target: "marmot_channel", event_id = %envelope.event_id, "Welcome matches no key package we hold")
                }
                _ => {
                    tracing::warn!(target: "marmot_channel", event_id = %envelope.event_id, "Welcome failed: {e}");
                    return;
                }
            },
        }
        if let Err(e) = self.sessions.mark_welcome(envelope.created_at) {
            tracing::warn!(target: "marmot_channel", "Failed to persist session: {e}");
        }
    }

    async fn on_sidecar_event(self: &Arc<Self>, event: SidecarEvent) {
        match event {
            SidecarEvent::Notification(notification) => self.on_notification(notification),
            SidecarEvent::Disconnected => {
                tracing::warn!(target: "marmot_channel", "Sidecar disconnected, restarting");
                match self.supervisor.reconnect().await {
                    Ok(()) => {}
                    Err(marmot_sidecar::Error::EngineDown { attempts }) => {
                        self.emit(ChannelEvent::EngineDown { attempts })
                    }
                    Err(e) => tracing::warn!(target: "marmot_channel", "Sidecar restart failed: {e}"),
                }
            }
            SidecarEvent::Restarted => {
                let workers = self.workers.lock();
                tracing::info!(target: "marmot_channel", groups = workers.len(), "Sidecar restarted, replaying");
                for worker in workers.values() {
                    worker.send(Inbound::Replay);
                }
            }
        }
    }

    fn on_notification(self: &Arc<Self>, notification: marmot_sidecar::Notification) {
        use marmot_sidecar::Notification;

        let group_id = notification.group_id();
        let conversation_id = self.sessions.conversation_for(&group_id);
        match notification {
            Notification::EpochAdvanced {
                epoch,
                rolled_back_from,
                ..
            } => self.emit(ChannelEvent::EpochAdvanced {
                conversation_id,
                group_id,
                epoch,
                rolled_back_from,
            }),
            Notification::MemberRemoved { epoch, identity, .. } => self.emit(ChannelEvent::MemberRemoved {
                conversation_id,
                group_id,
                epoch,
                identity,
            }),
            Notification::Removed { epoch, .. } => {
                tracing::info!(target: "marmot_channel", ?group_id, epoch, "Removed from group");
                self.emit(ChannelEvent::Closed {
                    conversation_id,
                    group_id,
                });
                self.retire_after_grace(group_id);
            }
            Notification::Reinstated { epoch, .. } => {
                tracing::info!(target: "marmot_channel", ?group_id, epoch, "Removal undone by a winning commit");
                self.emit(ChannelEvent::Reinstated {
                    conversation_id,
                    group_id,
                    epoch,
                });
            }
            Notification::CommitDiscarded {
                epoch,
                event_id,
                added,
                removed,
                ..
            } => {
                tracing::warn!(target: "marmot_channel", ?group_id, epoch, %event_id, "Local commit lost its epoch and was rolled back");
                self.emit(ChannelEvent::CommitRolledBack {
                    conversation_id,
                    group_id,
                    epoch,
                    commit_event_id: event_id,
                    added,
                    removed,
                });
            }
            Notification::GroupClosed { .. } => {
                // a group left on purpose was already reported by `leave_group`
                if self.stop_worker(&group_id) {
                    tracing::info!(target: "marmot_channel", ?group_id, "Group closed");
                    self.emit(ChannelEvent::Closed {
                        conversation_id,
                        group_id,
                    });
                }
            }
            Notification::GroupJoined { .. } => {}
        }
    }
}

/// A Marmot channel for one identity
///
/// Maps host conversations to groups, runs one worker per active group, joins
/// groups it is welcomed to, and keeps the sidecar alive. Everything the host
/// needs to hear about arrives on the [`ChannelEvent`] receiver returned by
/// [`MarmotChannel::start`].
pub struct MarmotChannel {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for MarmotChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarmotChannel")
            .field("identity", &self.shared.identity)
            .field("transport", &self.shared.transport)
            .finish_non_exhaustive()
    }
}

impl MarmotChannel {
    /// Start the sidecar, resume every active group from its watermark and
    /// listen for welcomes
    pub async fn start(
        config: ChannelConfig,
        context: RuntimeContext,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>), Error> {
        let sessions = SessionStore::load(&config.state_dir).await?;
        let (supervisor, sidecar_events) = Supervisor::start(context.launcher, config.supervisor.clone()).await?;
        let identity = supervisor.identity().await?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let (welcomes, welcomes_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            supervisor,
            transport: Transport::new(context.relays, config.transport.clone()),
            sessions,
            envelope: config.envelope.clone(),
            replay_lookback: config.replay_lookback,
            removal_grace: config.removal_grace,
            identity,
            events,
            welcomes,
            workers: Mutex::new(HashMap::new()),
        });

        let groups = shared.supervisor.list_groups().await?;
        let mut resumed = 0;
        for group in groups {
            if group.lifecycle != GroupLifecycle::Active {
                continue;
            }
            if shared.sessions.record(&group.group_id).is_none() {
                shared.sessions.insert(SessionRecord::new(
                    group.group_id.to_hex(),
                    group.group_id,
                    group.epoch,
                ))?;
            }
            shared.spawn_worker(group.group_id);
            resumed += 1;
        }

        let tasks = vec![
            tokio::spawn(run_welcomes(Arc::clone(&shared), welcomes_rx)),
            tokio::spawn(run_sidecar_events(Arc::clone(&shared), sidecar_events)),
        ];
        tracing::info!(target: "marmot_channel", %identity, groups = resumed, "Channel started");
        Ok((Self { shared, tasks }, events_rx))
    }

    /// Local identity
    pub fn identity(&self) -> PublicKey {
        self.shared.identity
    }

    /// The supervised sidecar
    pub fn supervisor(&self) -> &Supervisor {
        &self.shared.supervisor
    }

    /// Every session, including those of closed groups
    pub fn sessions(&self) -> Vec<SessionRecord> {
        self.shared.sessions.records()
    }

    /// Group a conversation maps to
    pub fn group_id(&self, conversation_id: &str) -> Result<GroupId, Error> {
        self.shared
            .sessions
            .group_for(conversation_id)
            .ok_or_else(|| Error::UnknownConversation(conversation_id.to_string()))
    }

    /// Current state of a conversation's group
    pub async fn group(&self, conversation_id: &str) -> Result<GroupSummary, Error> {
        let group_id = self.group_id(conversation_id)?;
        Ok(self.shared.supervisor.get_group(group_id).await?)
    }

    /// Create a group with the local member alone and bind it to `conversation_id`
    pub async fn create_group(&self, conversation_id: &str) -> Result<GroupSummary, Error> {
        if self.shared.sessions.group_for(conversation_id).is_some() {
            return Err(Error::ConversationExists(conversation_id.to_string()));
        }
        let summary = self.shared.supervisor.create_group().await?;
        self.shared.sessions.insert(SessionRecord::new(
            conversation_id,
            summary.group_id,
            summary.epoch,
        ))?;
        self.shared.spawn_worker(summary.group_id);
        tracing::info!(target: "marmot_channel", conversation_id, "Created group");
        Ok(summary)
    }

    /// Publish a fresh key package so others can invite us
    pub async fn publish_key_package(&self) -> Result<EventId, Error> {
        let key_package = self.shared.supervisor.create_key_package().await?;
        let events = encode(&Payload::KeyPackage(key_package), None, &self.shared.envelope)?;
        self.shared.publish_all(&events).await?;
        events
            .first()
            .map(|e| e.id)
            .ok_or_else(|| Error::State("key package encoded to no events".to_string()))
    }

    /// Add `member` using the newest key package they published
    pub async fn invite(&self, conversation_id: &str, member: &PublicKey) -> Result<CommitOutcome, Error> {
        let events = self
            .shared
            .transport
            .fetch(filters::key_packages(member))
            .await
            .map_err(Error::Transport)?;
        let key_package = events
            .iter()
            .rev()
            .filter_map(|event| decode(event).ok())
            .find_map(|envelope| match envelope.payload {
                Payload::KeyPackage(kp) if kp.identity == *member => Some(kp),
                _ => None,
            })
            .ok_or(Error::NoKeyPackage(*member))?;
        self.invite_with_key_package(conversation_id, key_package).await
    }

    /// Add the owner of `key_package`
    pub async fn invite_with_key_package(
        &self,
        conversation_id: &str,
        key_package: KeyPackage,
    ) -> Result<CommitOutcome, Error> {
        let group_id = self.group_id(conversation_id)?;
        let supervisor = &self.shared.supervisor;
        let proposal = supervisor.propose_add(group_id, key_package).await?;
        let bundle = supervisor.commit(group_id, vec![proposal]).await?;
        self.shared.publish_commit(bundle).await
    }

    /// Remove `member` from the group
    pub async fn remove_member(&self, conversation_id: &str, member: &PublicKey) -> Result<CommitOutcome, Error> {
        let group_id = self.group_id(conversation_id)?;
        let supervisor = &self.shared.supervisor;
        let leaf_index = supervisor
            .get_group(group_id)
            .await?
            .members
            .iter()
            .find(|m| m.identity == *member)
            .map(|m| m.leaf_index)
            .ok_or(Error::UnknownMember(*member))?;
        let proposal = supervisor.propose_remove(group_id, leaf_index).await?;
        let bundle = supervisor.commit(group_id, vec![proposal]).await?;
        self.shared.publish_commit(bundle).await
    }

    /// Replace the local encryption key, advancing the epoch
    pub async fn rotate_keys(&self, conversation_id: &str) -> Result<CommitOutcome, Error> {
        let group_id = self.group_id(conversation_id)?;
        let supervisor = &self.shared.supervisor;
        let proposal = supervisor.propose_update(group_id).await?;
        let bundle = supervisor.commit(group_id, vec![proposal]).await?;
        self.shared.publish_commit(bundle).await
    }

    /// Encrypt `plaintext` for the conversation and publish it.
    ///
    /// Returns once every event of the message has been acknowledged by at least
    /// one relay.
    pub async fn send(&self, conversation_id: &str, plaintext: &[u8]) -> Result<EventId, Error> {
        let group_id = self.group_id(conversation_id)?;
        let message = self.shared.supervisor.encrypt(group_id, plaintext).await?;
        let events = encode(&Payload::Mls(MlsMessage::Application(message)), None, &self.shared.envelope)?;
        let Some(first) = events.first() else {
            return Err(Error::State("message encoded to no events".to_string()));
        };
        let (event_id, created_at) = (first.id, first.created_at);
        self.shared.publish_all(&events).await?;
        if let Err(e) = self.shared.sessions.mark_handled(&group_id, event_id, created_at) {
            tracing::warn!(target: "marmot_channel", "Failed to persist session: {e}");
        }
        tracing::debug!(target: "marmot_channel", conversation_id, %event_id, fragments = events.len(), "Message sent");
        Ok(event_id)
    }

    /// Hand in an event received outside the channel's own subscriptions.
    ///
    /// Group messages go to their group's worker, welcomes to the welcome task.
    /// Events for groups without a running session are ignored.
    pub fn on_event(&self, event: Event) -> Result<(), Error> {
        match event.kind {
            Kind::MlsWelcome => {
                if self.shared.welcomes.send(event).is_err() {
                    tracing::debug!(target: "marmot_channel", "Welcome task gone");
                }
            }
            Kind::MlsGroupMessage => {
                let Some(group_id) = routing_group(&event)? else {
                    return Err(marmot_envelope::Error::MissingTag("h").into());
                };
                match self.shared.workers.lock().get(&group_id) {
                    Some(worker) => worker.send(Inbound::Event(event)),
                    None => {
                        tracing::debug!(target: "marmot_channel", ?group_id, "No session for group, ignoring event")
                    }
                }
            }
            kind => tracing::debug!(target: "marmot_channel", %kind, "Ignoring event kind"),
        }
        Ok(())
    }

    /// Stop processing a conversation: cancel its worker and unsubscribe. The
    /// session and group survive and resume on the next start.
    pub fn close_session(&self, conversation_id: &str) -> Result<(), Error> {
        let group_id = self.group_id(conversation_id)?;
        if self.shared.stop_worker(&group_id) {
            tracing::info!(target: "marmot_channel", conversation_id, "Session closed");
        }
        Ok(())
    }

    /// Leave a conversation for good: stop its worker, erase the group in the
    /// sidecar and forget the session
    pub async fn leave_group(&self, conversation_id: &str) -> Result<(), Error> {
        let group_id = self.group_id(conversation_id)?;
        self.shared.stop_worker(&group_id);
        self.shared.supervisor.delete_group(group_id).await?;
        self.shared.sessions.remove(conversation_id)?;
        self.shared.emit(ChannelEvent::Closed {
            conversation_id: conversation_id.to_string(),
            group_id,
        });
        Ok(())
    }

    /// Stop every task and ask the sidecar to exit
    pub async fn shutdown(self) {
        self.shared.workers.lock().clear();
        for task in &self.tasks {
            task.abort();
        }
        if let Err(e) = self.shared.sessions.flush().await {
            tracing::warn!(target: "marmot_channel", "Sessions not saved: {e}");
        }
        self.shared.supervisor.shutdown().await;
        tracing::info!(target: "marmot_channel", "Channel stopped");
    }
}

impl Drop for MarmotChannel {
    fn drop(&mut self) {
        // workers and tasks hold the shared state; stopping them releases it
        self.shared.workers.lock().clear();
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn run_sidecar_events(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<SidecarEvent>) {
    while let Some(event) = events.recv().await {
        shared.on_sidecar_event(event).await;
    }
}

async fn run_welcomes(shared: Arc<Shared>, mut inbox: mpsc::UnboundedReceiver<Event>) {
    let mut reassembler = Reassembler::new(shared.envelope.clone());
    let mut subscription = subscribe_welcomes(&shared).await;
    let mut maintenance = tokio::time::interval(WELCOME_MAINTENANCE_INTERVAL);

    loop {
        tokio::select! {
            event = inbox.recv() => match event {
                Some(event) => shared.on_welcome_event(&mut reassembler, &event).await,
                None => break,
            },
            event = next_welcome(&mut subscription) => match event {
                Some(event) => shared.on_welcome_event(&mut reassembler, &event).await,
                None => subscription = None,
            },
            _ = maintenance.tick() => {
                for error in reassembler.expire() {
                    if let marmot_envelope::Error::IncompleteMessage { message_id, .. } = error {
                        shared.emit(ChannelEvent::IncompleteMessage { group_id: None, message_id });
                    }
                }
                if subscription.is_none() {
                    subscription = subscribe_welcomes(&shared).await;
                }
            }
        }
    }
}

async fn subscribe_welcomes(shared: &Shared) -> Option<Subscription> {
    let since = shared.sessions.welcome_since(shared.replay_lookback);
    match shared
        .transport
        .subscribe(filters::welcomes(&shared.identity, since))
        .await
    {
        Ok(subscription) => Some(subscription),
        Err(e) => {
            tracing::warn!(target: "marmot_channel", "Welcome subscription failed: {e}");
            None
        }
    }
}

async fn next_welcome(subscription: &mut Option<Subscription>) -> Option<Event> {
    match subscription {
        Some(subscription) => subscription.next_event().await,
        None => std::future::pending().await,
    }
}
