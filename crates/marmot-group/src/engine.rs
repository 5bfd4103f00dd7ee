//! Storage-backed engine
//!
//! [`MarmotEngine`] holds the one authoritative [`Group`] per group id. Every
//! operation runs against a copy of the cached group and only replaces the cache
//! after the new state has been checkpointed, so a failed operation or a failed
//! write leaves both the cache and storage at the previous state.

use std::collections::HashMap;

use marmot_storage_traits::groups::{GroupLifecycle, GroupRecord};
use marmot_storage_traits::key_packages::KeyPackageRecord;
use marmot_storage_traits::processed::{ProcessedEvent, ProcessedOutcome};
use marmot_storage_traits::{GroupId, MarmotStorageProvider, Secret, unix_now};
use nostr::{EventId, Keys, PublicKey};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::GroupConfig;
use crate::error::Error;
use crate::group::{CommitOutcome, DecryptedMessage, Group, GroupSummary};
use crate::key_packages::{KeyPackage, KeyPackageBundle};
use crate::messages::{ApplicationMessage, Commit, Welcome};
use crate::proposals::{Proposal, ProposalMessage};

/// A locally created commit, ready to publish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitBundle {
    /// Group
    pub group_id: GroupId,
    /// The staged commit
    pub commit: Commit,
    /// Welcomes for added members, keyed by their identity
    pub welcomes: Vec<(PublicKey, Welcome)>,
    /// Epoch the group reaches once the commit is applied
    pub epoch: u64,
}

/// Result of receiving a proposal from another member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalReceived {
    /// The verified proposal
    pub proposal: Proposal,
    /// The local member is expected to commit it
    pub should_commit: bool,
}

/// Builder for [`MarmotEngine`]
#[derive(Debug)]
pub struct MarmotEngineBuilder<Storage> {
    keys: Keys,
    storage: Storage,
    config: GroupConfig,
}

impl<Storage> MarmotEngineBuilder<Storage>
where
    Storage: MarmotStorageProvider,
{
    /// Create a new builder
    pub fn new(keys: Keys, storage: Storage) -> Self {
        Self {
            keys,
            storage,
            config: GroupConfig::default(),
        }
    }

    /// Set a custom configuration
    pub fn with_config(mut self, config: GroupConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine
    pub fn build(self) -> MarmotEngine<Storage> {
        // Prune old ledger entries on startup for persistent backends
        if self.storage.backend().is_persistent() {
            let min_timestamp = unix_now().saturating_sub(self.config.processed_event_ttl_secs);
            match self.storage.prune_processed_events(min_timestamp) {
                Ok(pruned) if pruned > 0 => {
                    tracing::info!(
                        target: "marmot_group::engine",
                        pruned,
                        ttl_seconds = self.config.processed_event_ttl_secs,
                        "Pruned processed events on startup"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(target: "marmot_group::engine", "Failed to prune processed events: {e}");
                }
            }
        }

        MarmotEngine {
            keys: self.keys,
            storage: self.storage,
            config: self.config,
            groups: Mutex::new(HashMap::new()),
        }
    }
}

/// The group engine
pub struct MarmotEngine<Storage>
where
    Storage: MarmotStorageProvider,
{
    keys: Keys,
    storage: Storage,
    config: GroupConfig,
    /// Groups loaded from storage so far
    groups: Mutex<HashMap<GroupId, Group>>,
}

impl<Storage> std::fmt::Debug for MarmotEngine<Storage>
where
    Storage: MarmotStorageProvider,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarmotEngine")
            .field("identity", &self.keys.public_key())
            .field("backend", &self.storage.backend())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<Storage> MarmotEngine<Storage>
where
    Storage: MarmotStorageProvider,
{
    /// Create a builder
    pub fn builder(keys: Keys, storage: Storage) -> MarmotEngineBuilder<Storage> {
        MarmotEngineBuilder::new(keys, storage)
    }

    /// Construct an engine with default configuration
    pub fn new(keys: Keys, storage: Storage) -> Self {
        Self::builder(keys, storage).build()
    }

    /// Local identity
    pub fn identity(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// Configuration
    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Storage
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    // ------------------------------------------------------------------
    // Key packages
    // ------------------------------------------------------------------

    /// Create a key package and keep its private half until a welcome consumes it
    pub fn create_key_package(&self) -> Result<KeyPackage, Error> {
        let bundle = KeyPackageBundle::generate(&self.keys, unix_now())?;
        let reference = bundle.key_package.reference();
        self.storage.save_key_package(KeyPackageRecord {
            reference: reference.clone(),
            identity: self.keys.public_key().to_hex(),
            bundle: bundle.to_stored()?,
            created_at: bundle.key_package.created_at,
        })?;
        tracing::debug!(target: "marmot_group::engine", %reference, "Created key package");
        Ok(bundle.key_package)
    }

    /// Number of key packages not yet consumed by a welcome
    pub fn pending_key_packages(&self) -> Result<usize, Error> {
        Ok(self.storage.count_key_packages()?)
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    /// Create a group with a random id and the local identity as only member
    pub fn create_group(&self) -> Result<GroupSummary, Error> {
        self.create_group_with_id(GroupId::random()?)
    }

    /// Create a group with a caller-chosen id
    pub fn create_group_with_id(&self, group_id: GroupId) -> Result<GroupSummary, Error> {
        if self.load(&group_id).is_ok() {
            return Err(Error::Storage(
                marmot_storage_traits::MarmotStorageError::AlreadyExists(format!(
                    "group {group_id}"
                )),
            ));
        }
        let group = Group::create(&self.keys, group_id)?;
        let summary = group.summary();
        self.checkpoint(&group)?;
        self.groups.lock().insert(group_id, group);
        tracing::info!(target: "marmot_group::engine", "Created group at epoch 0");
        Ok(summary)
    }

    /// Summary of one group
    pub fn get_group(&self, group_id: &GroupId) -> Result<GroupSummary, Error> {
        Ok(self.load(group_id)?.summary())
    }

    /// Summaries of every stored group, ordered by group id
    pub fn list_groups(&self) -> Result<Vec<GroupSummary>, Error> {
        let mut out = Vec::new();
        for record in self.storage.all_groups()? {
            out.push(self.load(&record.group_id)?.summary());
        }
        Ok(out)
    }

    /// Make every removal older than the grace period final, erasing the state
    /// kept to undo it. Returns the groups affected.
    pub fn finalize_removals(&self) -> Result<Vec<GroupId>, Error> {
        let now = unix_now();
        let mut finalized = Vec::new();
        for record in self.storage.all_groups()? {
            if record.lifecycle == GroupLifecycle::Closed && self.expire_removal(&record.group_id, now)? {
                finalized.push(record.group_id);
            }
        }
        Ok(finalized)
    }

    /// Close a group locally and erase its stored state
    pub fn delete_group(&self, group_id: &GroupId) -> Result<GroupSummary, Error> {
        let mut group = self.load(group_id)?;
        group.close();
        self.storage.delete_group(group_id)?;
        self.groups.lock().remove(group_id);
        tracing::info!(target: "marmot_group::engine", "Deleted group");
        Ok(group.summary())
    }

    // ------------------------------------------------------------------
    // Proposals and commits
    // ------------------------------------------------------------------

    /// Stage adding the owner of `key_package`
    pub fn propose_add(&self, group_id: &GroupId, key_package: KeyPackage) -> Result<Proposal, Error> {
        self.load(group_id)?.propose_add(key_package)
    }

    /// Stage removing the member at `leaf_index`
    pub fn propose_remove(&self, group_id: &GroupId, leaf_index: u32) -> Result<Proposal, Error> {
        self.load(group_id)?.propose_remove(leaf_index)
    }

    /// Stage replacing the local encryption key
    pub fn propose_update(&self, group_id: &GroupId) -> Result<Proposal, Error> {
        self.mutate(group_id, |group| group.propose_update())
    }

    /// Sign a proposal for the designated committer
    pub fn proposal_message(&self, group_id: &GroupId, proposal: Proposal) -> Result<ProposalMessage, Error> {
        self.load(group_id)?.proposal_message(&self.keys, proposal)
    }

    /// Verify and queue a proposal carried by `event_id`
    pub fn receive_proposal(
        &self,
        message: ProposalMessage,
        event_id: EventId,
    ) -> Result<ProposalReceived, Error> {
        self.ensure_unprocessed(&event_id)?;
        let group_id = message.group_id;
        let result = self.mutate(&group_id, |group| {
            let proposal = group.receive_proposal(message)?;
            Ok(ProposalReceived {
                proposal,
                should_commit: group.is_designated_committer(),
            })
        });
        // proposals become committed state only through a commit
        if let Err(e) = &result {
            self.record_failure(event_id, e, Some(group_id), None);
        }
        result
    }

    /// Build a commit over `proposals`. The group advances once the commit is seen
    /// on the wire and passed to [`MarmotEngine::apply_commit`].
    pub fn commit(&self, group_id: &GroupId, proposals: Vec<Proposal>) -> Result<CommitBundle, Error> {
        self.mutate(group_id, |group| {
            let result = group.commit(&self.keys, proposals)?;
            Ok(CommitBundle {
                group_id: *group_id,
                commit: result.commit,
                welcomes: result.welcomes,
                epoch: result.secrets.epoch,
            })
        })
    }

    /// Commit every proposal received in the current epoch, if any.
    ///
    /// Only the designated committer commits inbound proposals; everyone else
    /// gets `None` and waits for its commit.
    pub fn commit_received_proposals(&self, group_id: &GroupId) -> Result<Option<CommitBundle>, Error> {
        let group = self.load(group_id)?;
        if !group.is_designated_committer() {
            tracing::debug!(
                target: "marmot_group::engine",
                designated = group.designated_committer(),
                "Leaving received proposals to the designated committer"
            );
            return Ok(None);
        }
        let proposals = group.received_proposals();
        if proposals.is_empty() {
            return Ok(None);
        }
        self.commit(group_id, proposals).map(Some)
    }

    /// Apply a commit carried by `event_id`
    pub fn apply_commit(&self, commit: &Commit, event_id: EventId) -> Result<CommitOutcome, Error> {
        self.ensure_unprocessed(&event_id)?;
        let group_id = commit.group_id;
        let now = unix_now();
        self.expire_removal(&group_id, now)?;
        let result = self.mutate(&group_id, |group| {
            let outcome = group.apply_commit(commit, event_id, &self.config)?;
            if outcome.self_removed {
                group.mark_removed(now);
            }
            Ok(outcome)
        });
        match result {
            Ok(outcome) => {
                self.record(event_id, Some(group_id), Some(outcome.epoch), ProcessedOutcome::CommitApplied, None)?;
                Ok(outcome)
            }
            Err(e) => {
                self.record_failure(event_id, &e, Some(group_id), Some(commit.epoch));
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Application messages
    // ------------------------------------------------------------------

    /// Encrypt under the group's current epoch
    pub fn encrypt(&self, group_id: &GroupId, plaintext: &[u8]) -> Result<ApplicationMessage, Error> {
        // the sending ratchet position is checkpointed so a restart never reuses a key
        self.mutate(group_id, |group| group.encrypt(&self.keys, plaintext))
    }

    /// Decrypt an application message carried by `event_id`
    pub fn decrypt(&self, message: &ApplicationMessage, event_id: EventId) -> Result<DecryptedMessage, Error> {
        self.ensure_unprocessed(&event_id)?;
        let group_id = message.group_id;
        match self.mutate(&group_id, |group| group.decrypt(message, &self.config)) {
            Ok(decrypted) => {
                self.record(event_id, Some(group_id), Some(message.epoch), ProcessedOutcome::Decrypted, None)?;
                Ok(decrypted)
            }
            Err(e) => {
                self.record_failure(event_id, &e, Some(group_id), Some(message.epoch));
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Welcomes
    // ------------------------------------------------------------------

    /// Join a group from a welcome carried by `event_id`, consuming the key package
    pub fn process_welcome(&self, welcome: &Welcome, event_id: EventId) -> Result<GroupSummary, Error> {
        self.ensure_unprocessed(&event_id)?;
        match self.join(welcome) {
            Ok(summary) => {
                self.record(
                    event_id,
                    Some(summary.group_id),
                    Some(summary.epoch),
                    ProcessedOutcome::WelcomeProcessed,
                    None,
                )?;
                Ok(summary)
            }
            Err(e) => {
                self.record_failure(event_id, &e, None, None);
                Err(e)
            }
        }
    }

    fn join(&self, welcome: &Welcome) -> Result<GroupSummary, Error> {
        let record = self
            .storage
            .find_key_package(&welcome.key_package_ref)?
            .ok_or(Error::UnknownWelcome)?;
        let bundle = KeyPackageBundle::from_stored(&record.bundle)?;
        let group = Group::join(&self.keys, &bundle, welcome)?;

        let group_id = group.group_id();
        if let Ok(existing) = self.load(&group_id)
            && existing.lifecycle() == GroupLifecycle::Active
        {
            return Err(Error::Storage(
                marmot_storage_traits::MarmotStorageError::AlreadyExists(format!(
                    "group {group_id}"
                )),
            ));
        }

        self.checkpoint(&group)?;
        self.storage.delete_key_package(&welcome.key_package_ref)?;
        let summary = group.summary();
        self.groups.lock().insert(group_id, group);
        tracing::info!(
            target: "marmot_group::engine",
            epoch = summary.epoch,
            members = summary.members.len(),
            "Joined group from welcome"
        );
        Ok(summary)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Finalize the group's removal if its grace period has passed
    fn expire_removal(&self, group_id: &GroupId, now: u64) -> Result<bool, Error> {
        let Ok(group) = self.load(group_id) else {
            return Ok(false);
        };
        let expired = group
            .removed_at()
            .is_some_and(|at| now.saturating_sub(at) >= self.config.removal_grace_secs);
        if !expired {
            return Ok(false);
        }
        self.mutate(group_id, |group| {
            group.close();
            Ok(())
        })?;
        tracing::info!(target: "marmot_group::engine", "Removal is final, rollback state erased");
        Ok(true)
    }

    /// Cached group, loading it from storage on first use
    fn load(&self, group_id: &GroupId) -> Result<Group, Error> {
        let mut groups = self.groups.lock();
        if let Some(group) = groups.get(group_id) {
            return Ok(group.clone());
        }
        let record = self.storage.find_group(group_id)?.ok_or(Error::GroupNotFound)?;
        let group: Group = serde_json::from_str(record.state.expose())?;
        groups.insert(*group_id, group.clone());
        Ok(group)
    }

    /// Run `f` on a copy of the group; persist and publish the copy only on success
    fn mutate<T, F>(&self, group_id: &GroupId, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Group) -> Result<T, Error>,
    {
        let mut group = self.load(group_id)?;
        let out = f(&mut group)?;
        self.checkpoint(&group)?;
        self.groups.lock().insert(*group_id, group);
        Ok(out)
    }

    fn checkpoint(&self, group: &Group) -> Result<(), Error> {
        self.storage.save_group(GroupRecord {
            group_id: group.group_id(),
            epoch: group.epoch(),
            lifecycle: group.lifecycle(),
            state: Secret::new(serde_json::to_string(group)?),
            updated_at: unix_now(),
        })?;
        Ok(())
    }

    fn ensure_unprocessed(&self, event_id: &EventId) -> Result<(), Error> {
        match self.storage.find_processed_event(&event_id.to_hex())? {
            Some(_) => Err(Error::AlreadyProcessed(*event_id)),
            None => Ok(()),
        }
    }

    fn record(
        &self,
        event_id: EventId,
        group_id: Option<GroupId>,
        epoch: Option<u64>,
        outcome: ProcessedOutcome,
        failure_reason: Option<String>,
    ) -> Result<(), Error> {
        self.storage.save_processed_event(ProcessedEvent {
            event_id: event_id.to_hex(),
            group_id,
            epoch,
            outcome,
            failure_reason,
            processed_at: unix_now(),
        })?;
        Ok(())
    }

    /// Sanitized reason stored in the ledger
    fn failure_reason(error: &Error) -> &'static str {
        match error {
            Error::InvalidProposal(_) => "invalid_proposal",
            Error::CommitConflict { .. } => "commit_conflict",
            Error::StaleEpoch(_) => "stale_epoch",
            Error::AuthenticationFailure(_) => "authentication_failed",
            Error::WrongGroupId => "wrong_group",
            Error::CannotDecryptOwnMessage => "own_message",
            Error::UnknownWelcome => "unknown_welcome",
            _ => "processing_failed",
        }
    }

    /// Record a terminal failure so the event is not retried. Non-terminal
    /// failures such as an epoch mismatch stay unrecorded.
    fn record_failure(&self, event_id: EventId, error: &Error, group_id: Option<GroupId>, epoch: Option<u64>) {
        if !error.is_terminal() {
            tracing::debug!(target: "marmot_group::engine", %event_id, "Event not processable yet: {error}");
            return;
        }
        let reason = Self::failure_reason(error);
        tracing::warn!(target: "marmot_group::engine", %event_id, reason, "Event rejected");
        if let Err(e) = self.record(event_id, group_id, epoch, ProcessedOutcome::Rejected, Some(reason.to_string())) {
            tracing::warn!(target: "marmot_group::engine", "Failed to record rejected event: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use marmot_storage_traits::processed::ProcessedEventStorage;
    use marmot_memory_storage::MarmotMemoryStorage;

    use super::*;
    use crate::test_util::{event_id, memory_engine};

    #[test]
    fn test_create_and_list_groups() {
        let engine = memory_engine();
        let a = engine.create_group().unwrap();
        let b = engine.create_group().unwrap();
        let listed = engine.list_groups().unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().any(|g| g.group_id == a.group_id));
        assert!(listed.iter().any(|g| g.group_id == b.group_id));
        assert_eq!(a.members[0].identity, engine.identity());
    }

    #[test]
    fn test_unknown_group() {
        let engine = memory_engine();
        assert_eq!(
            engine.get_group(&GroupId::from_bytes([9; 32])),
            Err(Error::GroupNotFound)
        );
    }

    #[test]
    fn test_create_duplicate_group_id() {
        let engine = memory_engine();
        let id = GroupId::from_bytes([3; 32]);
        engine.create_group_with_id(id).unwrap();
        assert!(matches!(engine.create_group_with_id(id), Err(Error::Storage(_))));
    }

    #[test]
    fn test_key_package_is_stored_until_consumed() {
        let engine = memory_engine();
        let kp = engine.create_key_package().unwrap();
        kp.validate().unwrap();
        assert_eq!(kp.identity, engine.identity());
        assert_eq!(engine.pending_key_packages().unwrap(), 1);
    }

    #[test]
    fn test_welcome_without_key_package() {
        let alice = memory_engine();
        let bob = memory_engine();
        let group = alice.create_group().unwrap();
        let kp = bob.create_key_package().unwrap();
        let add = alice.propose_add(&group.group_id, kp).unwrap();
        let bundle = alice.commit(&group.group_id, vec![add]).unwrap();

        let stranger = memory_engine();
        let (_, welcome) = &bundle.welcomes[0];
        assert_eq!(
            stranger.process_welcome(welcome, event_id(7)),
            Err(Error::UnknownWelcome)
        );
        // terminal failures are recorded
        assert_eq!(
            stranger.process_welcome(welcome, event_id(7)),
            Err(Error::AlreadyProcessed(event_id(7)))
        );
    }

    #[test]
    fn test_epoch_mismatch_is_not_recorded() {
        let alice = memory_engine();
        let group = alice.create_group().unwrap();
        let mut bundle = alice.commit(&group.group_id, vec![]).unwrap();
        bundle.commit.epoch = 3;
        assert!(matches!(
            alice.apply_commit(&bundle.commit, event_id(1)),
            Err(Error::EpochMismatch { .. })
        ));
        assert!(alice.storage().find_processed_event(&event_id(1).to_hex()).unwrap().is_none());
    }

    #[test]
    fn test_failed_operation_leaves_state_untouched() {
        let alice = memory_engine();
        let group = alice.create_group().unwrap();
        let before = alice.get_group(&group.group_id).unwrap();
        assert!(alice.propose_remove(&group.group_id, 4).is_err());
        let mut bundle = alice.commit(&group.group_id, vec![]).unwrap();
        bundle.commit.signature = "00".repeat(64);
        assert!(alice.apply_commit(&bundle.commit, event_id(1)).is_err());
        assert_eq!(alice.get_group(&group.group_id).unwrap(), before);
    }

    #[test]
    fn test_delete_group() {
        let engine = memory_engine();
        let group = engine.create_group().unwrap();
        let closed = engine.delete_group(&group.group_id).unwrap();
        assert_eq!(closed.lifecycle, GroupLifecycle::Closed);
        assert_eq!(engine.get_group(&group.group_id), Err(Error::GroupNotFound));
        assert!(engine.list_groups().unwrap().is_empty());
    }

    #[test]
    fn test_groups_reload_from_storage() {
        let storage = MarmotMemoryStorage::default();
        let keys = Keys::generate();
        let engine = MarmotEngine::new(keys.clone(), storage);
        let group = engine.create_group().unwrap();
        let bundle = engine.commit(&group.group_id, vec![]).unwrap();
        engine.apply_commit(&bundle.commit, event_id(1)).unwrap();

        // drop the cache, keep the storage
        engine.groups.lock().clear();
        let reloaded = engine.get_group(&group.group_id).unwrap();
        assert_eq!(reloaded.epoch, 1);
        assert_eq!(reloaded.epoch_authenticator, engine.get_group(&group.group_id).unwrap().epoch_authenticator);
    }
}
