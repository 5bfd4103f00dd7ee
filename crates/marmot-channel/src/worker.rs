//! Per-group worker
//!
//! Each active group gets one task that owns its relay subscription and its
//! fragment buffer, and feeds the group's events to the sidecar strictly one at
//! a time, so commits are applied in order and messages surface in arrival
//! order. Groups never wait on each other.
//!
//! A message for a future epoch is deferred and triggers a resync: the worker
//! fetches the group's recent history, applies the commits it finds in
//! `(epoch, event id)` order and retries the deferred messages.

use std::sync::Arc;
use std::time::Duration;

use marmot_envelope::{Envelope, MessageKind, Payload, Reassembler, filters};
use marmot_group::{ApplicationMessage, Commit, MlsMessage, ProposalMessage};
use marmot_sidecar::ErrorCode;
use marmot_storage_traits::GroupId;
use marmot_transport::Subscription;
use nostr::{Event, EventId, Timestamp};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::channel::Shared;
use crate::event::ChannelEvent;

/// How often fragment buffers are expired and lost subscriptions reopened
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);

/// Work sent to a worker
#[derive(Debug)]
pub(crate) enum Inbound {
    /// An event handed in by the host
    Event(Event),
    /// The sidecar restarted; replay from the watermark
    Replay,
}

/// Handle to a running worker. Dropping it stops the worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    inbox: mpsc::UnboundedSender<Inbound>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub(crate) fn send(&self, inbound: Inbound) {
        if self.inbox.send(inbound).is_err() {
            tracing::debug!(target: "marmot_channel::worker", "Worker gone, dropping input");
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start the worker for `group_id`
pub(crate) fn spawn(shared: Arc<Shared>, group_id: GroupId) -> WorkerHandle {
    let (inbox, rx) = mpsc::unbounded_channel();
    let worker = GroupWorker {
        reassembler: Reassembler::new(shared.envelope.clone()),
        shared,
        group_id,
        deferred: Vec::new(),
    };
    WorkerHandle {
        inbox,
        task: tokio::spawn(worker.run(rx)),
    }
}

/// What became of one message
enum Step {
    /// Finished, successfully or not; never handle it again
    Handled,
    /// The sidecar could not be asked; a later replay retries it
    Retry,
    /// It targets an epoch the group has not reached
    Mismatch(String),
}

struct GroupWorker {
    shared: Arc<Shared>,
    group_id: GroupId,
    reassembler: Reassembler,
    deferred: Vec<Envelope>,
}

impl GroupWorker {
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Inbound>) {
        tracing::debug!(target: "marmot_channel::worker", group_id = ?self.group_id, "Worker started");
        self.replay().await;
        let mut subscription = self.subscribe().await;
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);

        loop {
            tokio::select! {
                inbound = inbox.recv() => match inbound {
                    Some(Inbound::Event(event)) => self.on_event(event).await,
                    Some(Inbound::Replay) => self.replay().await,
                    None => break,
                },
                event = next_event(&mut subscription) => match event {
                    Some(event) => self.on_event(event).await,
                    None => {
                        tracing::warn!(target: "marmot_channel::worker", group_id = ?self.group_id, "Subscription ended");
                        subscription = None;
                    }
                },
                _ = maintenance.tick() => {
                    self.expire_fragments();
                    if subscription.is_none() {
                        subscription = self.subscribe().await;
                    }
                }
            }
        }
        tracing::debug!(target: "marmot_channel::worker", group_id = ?self.group_id, "Worker stopped");
    }

    async fn subscribe(&self) -> Option<Subscription> {
        let since = self
            .shared
            .sessions
            .replay_since(&self.group_id, self.shared.replay_lookback);
        match self
            .shared
            .transport
            .subscribe(filters::group_messages([&self.group_id], since))
            .await
        {
            Ok(subscription) => Some(subscription),
            Err(e) => {
                tracing::warn!(target: "marmot_channel::worker", group_id = ?self.group_id, "Subscribe failed: {e}");
                None
            }
        }
    }

    async fn on_event(&mut self, event: Event) {
        if self.shared.sessions.is_handled(&self.group_id, &event.id) {
            return;
        }
        match self.reassembler.push(&event) {
            Ok(Some(envelope)) => self.dispatch(envelope).await,
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(target: "marmot_channel::worker", event_id = %event.id, "Dropping undecodable event: {e}")
            }
        }
    }

    async fn dispatch(&mut self, envelope: Envelope) {
        if envelope.group_id() != Some(self.group_id) {
            tracing::debug!(target: "marmot_channel::worker", event_id = %envelope.event_id, "Event names another group");
            return;
        }
        match self.process(&envelope).await {
            Step::Handled => self.mark_handled(envelope.event_id, envelope.created_at),
            Step::Retry => {}
            Step::Mismatch(reason) => {
                tracing::debug!(target: "marmot_channel::worker", event_id = %envelope.event_id, "Deferring: {reason}");
                self.deferred.push(envelope);
                self.resync().await;
            }
        }
    }

    /// Startup and post-restart catch-up: every commit first, in tie-break
    /// order, then the rest in arrival order
    async fn replay(&mut self) {
        let since = self
            .shared
            .sessions
            .replay_since(&self.group_id, self.shared.replay_lookback);
        let envelopes = match self.fetch(since).await {
            Ok(envelopes) => envelopes,
            Err(reason) => {
                tracing::warn!(target: "marmot_channel::worker", group_id = ?self.group_id, "Replay fetch failed: {reason}");
                return;
            }
        };
        let (commits, rest): (Vec<_>, Vec<_>) = envelopes
            .into_iter()
            .filter(|e| !self.shared.sessions.is_handled(&self.group_id, &e.event_id))
            .partition(|e| e.kind() == MessageKind::Commit);
        tracing::debug!(
            target: "marmot_channel::worker",
            group_id = ?self.group_id,
            commits = commits.len(),
            messages = rest.len(),
            "Replaying"
        );
        self.apply_commits(commits).await;
        for envelope in rest {
            self.dispatch(envelope).await;
        }
    }

    async fn resync(&mut self) {
        let since = self
            .shared
            .sessions
            .replay_since(&self.group_id, self.shared.replay_lookback);
        tracing::info!(
            target: "marmot_channel::worker",
            group_id = ?self.group_id,
            deferred = self.deferred.len(),
            "Epoch mismatch, fetching missed commits"
        );
        match self.fetch(since).await {
            Ok(envelopes) => {
                let commits = envelopes
                    .into_iter()
                    .filter(|e| e.kind() == MessageKind::Commit)
                    .filter(|e| !self.shared.sessions.is_handled(&self.group_id, &e.event_id))
                    .collect();
                self.apply_commits(commits).await;
            }
            Err(reason) => {
                for envelope in std::mem::take(&mut self.deferred) {
                    self.resync_failed(envelope.event_id, reason.clone());
                }
                return;
            }
        }

        for envelope in std::mem::take(&mut self.deferred) {
            match self.process(&envelope).await {
                Step::Handled => self.mark_handled(envelope.event_id, envelope.created_at),
                Step::Retry => {}
                Step::Mismatch(reason) => self.resync_failed(envelope.event_id, reason),
            }
        }
    }

    async fn apply_commits(&mut self, mut commits: Vec<Envelope>) {
        // the smallest event id wins an epoch
        commits.sort_by_key(|e| (e.epoch().unwrap_or_default(), e.event_id.to_hex()));
        for envelope in commits {
            match self.process(&envelope).await {
                Step::Handled => self.mark_handled(envelope.event_id, envelope.created_at),
                Step::Retry => {}
                Step::Mismatch(reason) => {
                    tracing::debug!(target: "marmot_channel::worker", event_id = %envelope.event_id, "Commit not applicable yet: {reason}")
                }
            }
        }
    }

    /// Group history since `since`, reassembled, in arrival order
    async fn fetch(&self, since: Option<Timestamp>) -> Result<Vec<Envelope>, String> {
        let events = self
            .shared
            .transport
            .fetch(filters::group_messages([&self.group_id], since))
            .await
            .map_err(|e| e.to_string())?;
        let mut reassembler = Reassembler::new(self.shared.envelope.clone());
        let mut envelopes = Vec::new();
        for event in &events {
            match reassembler.push(event) {
                Ok(Some(envelope)) if envelope.group_id() == Some(self.group_id) => envelopes.push(envelope),
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(target: "marmot_channel::worker", event_id = %event.id, "Skipping fetched event: {e}")
                }
            }
        }
        Ok(envelopes)
    }

    async fn process(&self, envelope: &Envelope) -> Step {
        let event_id = envelope.event_id;
        let result = match &envelope.payload {
            Payload::Mls(MlsMessage::Commit(commit)) => self.apply_commit(commit.clone(), event_id).await,
            Payload::Mls(MlsMessage::Proposal(message)) => {
                self.receive_proposal(message.clone(), event_id).await
            }
            Payload::Mls(MlsMessage::Application(message)) => self.decrypt(message.clone(), envelope).await,
            Payload::Mls(MlsMessage::Welcome(_)) | Payload::KeyPackage(_) => Ok(()),
        };
        match result {
            Ok(()) => Step::Handled,
            Err(e) => self.classify(e, envelope),
        }
    }

    fn classify(&self, error: marmot_sidecar::Error, envelope: &Envelope) -> Step {
        let Some(code) = error.code() else {
            tracing::warn!(
                target: "marmot_channel::worker",
                event_id = %envelope.event_id,
                "Sidecar request failed, leaving event for replay: {error}"
            );
            return Step::Retry;
        };
        match code {
            ErrorCode::EpochMismatch => Step::Mismatch(error.to_string()),
            ErrorCode::AlreadyProcessed | ErrorCode::OwnMessage => Step::Handled,
            ErrorCode::StaleEpoch | ErrorCode::AuthenticationFailure
                if envelope.kind() == MessageKind::Application =>
            {
                let joined_epoch = self
                    .shared
                    .sessions
                    .record(&self.group_id)
                    .map(|r| r.joined_epoch)
                    .unwrap_or_default();
                // history from before we joined was never ours to read
                if envelope.epoch().unwrap_or_default() >= joined_epoch {
                    self.shared.emit(ChannelEvent::DecryptFailed {
                        conversation_id: self.conversation_id(),
                        group_id: self.group_id,
                        event_id: envelope.event_id,
                        code,
                    });
                }
                Step::Handled
            }
            _ => {
                tracing::debug!(
                    target: "marmot_channel::worker",
                    event_id = %envelope.event_id,
                    kind = %envelope.kind(),
                    "Event rejected: {error}"
                );
                Step::Handled
            }
        }
    }

    async fn apply_commit(&self, commit: Commit, event_id: EventId) -> Result<(), marmot_sidecar::Error> {
        let outcome = self.shared.supervisor.apply_commit(commit, event_id).await?;
        tracing::debug!(target: "marmot_channel::worker", epoch = outcome.epoch, %event_id, "Applied commit");
        self.shared.record_epoch(&self.group_id, outcome.epoch);
        Ok(())
    }

    async fn receive_proposal(
        &self,
        message: ProposalMessage,
        event_id: EventId,
    ) -> Result<(), marmot_sidecar::Error> {
        let received = self.shared.supervisor.receive_proposal(message, event_id).await?;
        if !received.should_commit {
            return Ok(());
        }
        if let Some(bundle) = self.shared.supervisor.commit_received(self.group_id).await?
            && let Err(e) = self.shared.publish_commit(bundle).await
        {
            tracing::warn!(target: "marmot_channel::worker", group_id = ?self.group_id, "Committing received proposals failed: {e}");
        }
        Ok(())
    }

    async fn decrypt(
        &self,
        message: ApplicationMessage,
        envelope: &Envelope,
    ) -> Result<(), marmot_sidecar::Error> {
        let plaintext = self
            .shared
            .supervisor
            .decrypt(message, envelope.event_id)
            .await?;
        let content = match plaintext.bytes() {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(target: "marmot_channel::worker", event_id = %envelope.event_id, "Undecodable plaintext: {e}");
                return Ok(());
            }
        };
        self.shared.emit(ChannelEvent::Message {
            conversation_id: self.conversation_id(),
            group_id: self.group_id,
            sender: plaintext.sender,
            epoch: plaintext.epoch,
            event_id: envelope.event_id,
            created_at: envelope.created_at,
            content,
        });
        Ok(())
    }

    fn resync_failed(&self, event_id: EventId, reason: String) {
        tracing::warn!(target: "marmot_channel::worker", group_id = ?self.group_id, %event_id, "Resync failed: {reason}");
        self.shared.emit(ChannelEvent::ResyncFailed {
            conversation_id: self.conversation_id(),
            group_id: self.group_id,
            event_id,
            reason,
        });
    }

    fn expire_fragments(&mut self) {
        for error in self.reassembler.expire() {
            if let marmot_envelope::Error::IncompleteMessage { message_id, .. } = error {
                self.shared.emit(ChannelEvent::IncompleteMessage {
                    group_id: Some(self.group_id),
                    message_id,
                });
            }
        }
    }

    fn mark_handled(&self, event_id: EventId, created_at: Timestamp) {
        if let Err(e) = self
            .shared
            .sessions
            .mark_handled(&self.group_id, event_id, created_at)
        {
            tracing::warn!(target: "marmot_channel::worker", "Failed to persist session: {e}");
        }
    }

    fn conversation_id(&self) -> String {
        self.shared.sessions.conversation_for(&self.group_id)
    }
}

/// Next event of an optional subscription; never resolves without one
async fn next_event(subscription: &mut Option<Subscription>) -> Option<Event> {
    match subscription {
        Some(subscription) => subscription.next_event().await,
        None => std::future::pending().await,
    }
}
