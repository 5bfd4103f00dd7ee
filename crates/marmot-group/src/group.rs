//! The group state machine
//!
//! A [`Group`] is `Active` at some epoch until the local member is removed or the
//! group is deleted, at which point it is `Closed`. A removal stays reversible
//! while its snapshot is kept, in case the removing commit loses a race; a
//! deletion is final. Everything that changes
//! membership or keys goes through a [`Commit`]; applying the same commit on every
//! member yields identical contexts and secrets.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use marmot_storage_traits::groups::GroupLifecycle;
use marmot_storage_traits::{GroupId, Secret};
use nostr::{EventId, Keys, PublicKey};
use serde::{Deserialize, Serialize};

use crate::GroupConfig;
use crate::constant::DEFAULT_CAPABILITIES;
use crate::crypto::{self, Key32};
use crate::epoch_snapshots::{EpochSnapshot, EpochSnapshots, RaceDecision};
use crate::error::Error;
use crate::key_packages::{KeyPackage, KeyPackageBundle};
use crate::key_schedule::{EpochSecrets, GroupContext, NewEpochSecrets};
use crate::messages::{
    ApplicationMessage, Commit, EncryptedPathSecret, GroupInfo, SignedContent, UpdatePath,
    Welcome,
};
use crate::proposals::{Proposal, ProposalMessage};
use crate::ratchet::SenderRatchet;
use crate::tree::{Leaves, Member};

/// A commit made locally but not yet seen on the wire
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct PendingCommit {
    /// Hex content digest of the commit
    digest: String,
    commit_secret: Key32,
    /// Committer's new leaf encryption secret
    encryption_secret: Key32,
}

/// Everything known about one epoch
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct EpochState {
    pub context: GroupContext,
    pub leaves: Leaves,
    pub secrets: EpochSecrets,
    pub own_leaf: u32,
    own_encryption_secret: Key32,
    sending: SenderRatchet,
    receiving: BTreeMap<u32, SenderRatchet>,
    pending_commit: Option<PendingCommit>,
    /// Secrets behind update proposals made in this epoch, by public key hex
    pending_updates: BTreeMap<String, Key32>,
    received_proposals: Vec<ProposalMessage>,
}

impl EpochState {
    fn new(
        context: GroupContext,
        leaves: Leaves,
        secrets: EpochSecrets,
        own_leaf: u32,
        own_encryption_secret: Key32,
    ) -> Result<Self, Error> {
        let sending = SenderRatchet::new(secrets.encryption.expose(), own_leaf)?;
        Ok(Self {
            context,
            leaves,
            secrets,
            own_leaf,
            own_encryption_secret,
            sending,
            receiving: BTreeMap::new(),
            pending_commit: None,
            pending_updates: BTreeMap::new(),
            received_proposals: Vec::new(),
        })
    }

    fn epoch(&self) -> u64 {
        self.context.epoch
    }
}

/// Result of applying a commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOutcome {
    /// Epoch after the commit
    pub epoch: u64,
    /// Identities added
    pub added: Vec<PublicKey>,
    /// Identities removed
    pub removed: Vec<PublicKey>,
    /// The local member was removed and the group is now closed
    pub self_removed: bool,
    /// Set when a competing commit was rolled back; the epoch the group was at
    pub rolled_back_from: Option<u64>,
    /// The rollback undid a commit that had removed the local member
    #[serde(default)]
    pub reinstated: bool,
    /// Local commits undone by the rollback, oldest first
    #[serde(default)]
    pub discarded: Vec<DiscardedCommit>,
}

/// A local commit that lost its epoch to a concurrent commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardedCommit {
    /// Event that carried it
    pub event_id: EventId,
    /// Epoch it was built against
    pub epoch: u64,
    /// Identities it added
    pub added: Vec<PublicKey>,
    /// Identities it removed
    pub removed: Vec<PublicKey>,
}

/// A decrypted application message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    /// Group
    pub group_id: GroupId,
    /// Epoch it was encrypted under
    pub epoch: u64,
    /// Sender leaf
    pub sender_leaf: u32,
    /// Sender identity
    pub sender: PublicKey,
    /// Plaintext
    pub plaintext: Vec<u8>,
}

/// Output of a local commit
#[derive(Debug, Clone)]
pub struct CommitResult {
    /// The commit to publish
    pub commit: Commit,
    /// Welcomes for added members, keyed by their identity
    pub welcomes: Vec<(PublicKey, Welcome)>,
    /// Secrets of the epoch the commit creates once applied
    pub secrets: NewEpochSecrets,
}

/// Member as listed in a summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSummary {
    /// Leaf index
    pub leaf_index: u32,
    /// Identity key
    pub identity: PublicKey,
}

/// Public view of a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    /// Group id
    pub group_id: GroupId,
    /// Current epoch
    pub epoch: u64,
    /// Lifecycle
    pub lifecycle: GroupLifecycle,
    /// Local leaf
    pub own_leaf: u32,
    /// Leaf expected to commit inbound proposals
    pub designated_committer: u32,
    /// Active members in leaf order
    pub members: Vec<MemberSummary>,
    /// Public epoch authenticator (hex)
    pub epoch_authenticator: String,
}

/// One group's full state
#[derive(Clone, Serialize, Deserialize)]
pub struct Group {
    lifecycle: GroupLifecycle,
    identity: PublicKey,
    current: EpochState,
    /// Superseded epochs still accepted for late ciphertext, oldest first
    retained: VecDeque<EpochState>,
    snapshots: EpochSnapshots,
    /// Unix time the local member was removed, while the removal can be undone
    #[serde(default)]
    removed_at: Option<u64>,
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("group_id", &self.current.context.group_id)
            .field("epoch", &self.current.epoch())
            .field("lifecycle", &self.lifecycle)
            .field("members", &self.current.leaves.len())
            .finish_non_exhaustive()
    }
}

impl Group {
    /// Create a group at epoch 0 with `identity` as its only member
    pub fn create(identity: &Keys, group_id: GroupId) -> Result<Self, Error> {
        let encryption = Keys::generate();
        let leaves = Leaves::single(Member {
            identity: identity.public_key(),
            leaf_index: 0,
            encryption_key: encryption.public_key(),
            capabilities: DEFAULT_CAPABILITIES.iter().map(|c| c.to_string()).collect(),
        });
        let context = GroupContext::genesis(group_id, leaves.tree_hash()?);
        let joiner_secret: [u8; 32] = crypto::random_bytes()?;
        let secrets = EpochSecrets::derive(&joiner_secret, &context)?;
        let state = EpochState::new(context, leaves, secrets, 0, crypto::secret_of(&encryption)?)?;

        Ok(Self {
            lifecycle: GroupLifecycle::Active,
            identity: identity.public_key(),
            current: state,
            retained: VecDeque::new(),
            snapshots: EpochSnapshots::default(),
            removed_at: None,
        })
    }

    /// Join from a welcome sealed to `bundle`'s init key
    pub fn join(identity: &Keys, bundle: &KeyPackageBundle, welcome: &Welcome) -> Result<Self, Error> {
        if welcome.key_package_ref != bundle.key_package.reference() {
            return Err(Error::UnknownWelcome);
        }
        let init = bundle.init_keys()?;
        let sealed = crypto::open_from(&init, &welcome.sender_key, &welcome.group_info)?;
        let info: GroupInfo = serde_json::from_slice(&sealed)
            .map_err(|e| Error::AuthenticationFailure(format!("group info: {e}")))?;

        let signer = info
            .leaves
            .get(info.signer)
            .ok_or_else(|| Error::AuthenticationFailure("group info signer is not a member".into()))?;
        crypto::verify(&signer.identity, &info.signed_digest(), &info.signature)?;
        if hex::encode(info.leaves.tree_hash()?) != info.context.tree_hash {
            return Err(Error::AuthenticationFailure(
                "group info tree does not match its context".into(),
            ));
        }

        let secrets = EpochSecrets::derive(info.joiner_secret.expose(), &info.context)?;
        secrets.verify_confirmation_tag(&info.context, &info.confirmation_tag)?;

        let own_leaf = info
            .leaves
            .members()
            .find(|m| {
                m.identity == identity.public_key()
                    && m.encryption_key == bundle.key_package.init_key
            })
            .map(|m| m.leaf_index)
            .ok_or_else(|| {
                Error::AuthenticationFailure("welcome does not include the local key package".into())
            })?;

        let state = EpochState::new(
            info.context.clone(),
            info.leaves.clone(),
            secrets,
            own_leaf,
            bundle.init_secret.clone(),
        )?;
        Ok(Self {
            lifecycle: GroupLifecycle::Active,
            identity: identity.public_key(),
            current: state,
            retained: VecDeque::new(),
            snapshots: EpochSnapshots::default(),
            removed_at: None,
        })
    }

    /// Group id
    pub fn group_id(&self) -> GroupId {
        self.current.context.group_id
    }

    /// Current epoch
    pub fn epoch(&self) -> u64 {
        self.current.epoch()
    }

    /// Current context
    pub fn context(&self) -> &GroupContext {
        &self.current.context
    }

    /// Lifecycle
    pub fn lifecycle(&self) -> GroupLifecycle {
        self.lifecycle
    }

    /// When the local member was removed by a commit that a concurrent winner
    /// can still undo. `None` once the group is active again or closed for good.
    pub fn removed_at(&self) -> Option<u64> {
        self.removed_at
    }

    pub(crate) fn mark_removed(&mut self, at: u64) {
        if self.lifecycle == GroupLifecycle::Closed && !self.snapshots.is_empty() {
            self.removed_at = Some(at);
        }
    }

    /// Local leaf
    pub fn own_leaf(&self) -> u32 {
        self.current.own_leaf
    }

    /// Active members in leaf order
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.current.leaves.members()
    }

    /// Lowest active leaf; the member expected to commit inbound proposals
    pub fn designated_committer(&self) -> u32 {
        self.current
            .leaves
            .members()
            .next()
            .map(|m| m.leaf_index)
            .unwrap_or_default()
    }

    /// True if the local member is the designated committer
    pub fn is_designated_committer(&self) -> bool {
        self.designated_committer() == self.own_leaf()
    }

    /// Public epoch authenticator (hex)
    pub fn epoch_authenticator(&self) -> String {
        self.current.secrets.epoch_authenticator()
    }

    /// Export a labelled secret of the current epoch
    pub fn export_secret(&self, label: &str, context: &[u8]) -> Result<Key32, Error> {
        self.current.secrets.export(label, context)
    }

    /// Public summary
    pub fn summary(&self) -> GroupSummary {
        GroupSummary {
            group_id: self.group_id(),
            epoch: self.epoch(),
            lifecycle: self.lifecycle,
            own_leaf: self.own_leaf(),
            designated_committer: self.designated_committer(),
            members: self
                .members()
                .map(|m| MemberSummary {
                    leaf_index: m.leaf_index,
                    identity: m.identity,
                })
                .collect(),
            epoch_authenticator: self.epoch_authenticator(),
        }
    }

    /// Mark the group closed and drop every retained secret.
    pub fn close(&mut self) {
        self.suspend();
        self.snapshots = EpochSnapshots::default();
        self.removed_at = None;
    }

    /// Closed, but the snapshots survive for a winning commit to roll back to
    fn suspend(&mut self) {
        self.lifecycle = GroupLifecycle::Closed;
        self.retained.clear();
        self.current.pending_commit = None;
        self.current.pending_updates.clear();
        self.current.received_proposals.clear();
    }

    #[cfg(test)]
    pub(crate) fn current_state(&self) -> &EpochState {
        &self.current
    }

    fn ensure_active(&self) -> Result<(), Error> {
        match self.lifecycle {
            GroupLifecycle::Active => Ok(()),
            GroupLifecycle::Closed => Err(Error::GroupClosed),
        }
    }

    fn check_group(&self, group_id: &GroupId) -> Result<(), Error> {
        if group_id == &self.group_id() {
            Ok(())
        } else {
            Err(Error::WrongGroupId)
        }
    }

    // ------------------------------------------------------------------
    // Proposals
    // ------------------------------------------------------------------

    /// Stage adding the owner of `key_package`
    pub fn propose_add(&self, key_package: KeyPackage) -> Result<Proposal, Error> {
        self.ensure_active()?;
        key_package.validate()?;
        if self.current.leaves.find_identity(&key_package.identity).is_some() {
            return Err(Error::InvalidProposal(format!(
                "{} is already a member",
                key_package.identity
            )));
        }
        Ok(Proposal::Add { key_package })
    }

    /// Stage removing the member at `leaf_index`
    pub fn propose_remove(&self, leaf_index: u32) -> Result<Proposal, Error> {
        self.ensure_active()?;
        if self.current.leaves.get(leaf_index).is_none() {
            return Err(Error::InvalidProposal(format!(
                "no member at leaf {leaf_index}"
            )));
        }
        Ok(Proposal::Remove { leaf_index })
    }

    /// Stage replacing the local encryption key.
    ///
    /// The new private key is kept with the current epoch until a commit
    /// carrying the proposal is applied, or the epoch moves on without it.
    pub fn propose_update(&mut self) -> Result<Proposal, Error> {
        self.ensure_active()?;
        let fresh = Keys::generate();
        self.current
            .pending_updates
            .insert(fresh.public_key().to_hex(), crypto::secret_of(&fresh)?);
        Ok(Proposal::Update {
            leaf_index: self.own_leaf(),
            encryption_key: fresh.public_key(),
        })
    }

    /// Sign a proposal for sending to the designated committer
    pub fn proposal_message(&self, identity: &Keys, proposal: Proposal) -> Result<ProposalMessage, Error> {
        self.ensure_active()?;
        ProposalMessage::sign(identity, self.group_id(), self.epoch(), self.own_leaf(), proposal)
    }

    /// Verify and queue a proposal sent by another member
    pub fn receive_proposal(&mut self, message: ProposalMessage) -> Result<Proposal, Error> {
        self.ensure_active()?;
        self.check_group(&message.group_id)?;
        match message.epoch.cmp(&self.epoch()) {
            std::cmp::Ordering::Greater => {
                return Err(Error::EpochMismatch {
                    expected: self.epoch(),
                    received: message.epoch,
                });
            }
            std::cmp::Ordering::Less => return Err(Error::StaleEpoch(message.epoch)),
            std::cmp::Ordering::Equal => {}
        }
        let sender = self
            .current
            .leaves
            .get(message.sender)
            .ok_or_else(|| Error::AuthenticationFailure("proposal sender is not a member".into()))?;
        message.verify(&sender.identity)?;

        match &message.proposal {
            Proposal::Update { leaf_index, .. } if *leaf_index != message.sender => {
                return Err(Error::InvalidProposal(
                    "update proposals may only target the sender's leaf".into(),
                ));
            }
            _ => {}
        }
        check_proposals(&self.current.leaves, None, std::slice::from_ref(&message.proposal))?;

        let proposal = message.proposal.clone();
        if !self.current.received_proposals.contains(&message) {
            self.current.received_proposals.push(message);
        }
        Ok(proposal)
    }

    /// Proposals received from other members in this epoch
    pub fn received_proposals(&self) -> Vec<Proposal> {
        self.current
            .received_proposals
            .iter()
            .map(|m| m.proposal.clone())
            .collect()
    }

    // ------------------------------------------------------------------
    // Commits
    // ------------------------------------------------------------------

    /// Build a commit over `proposals`.
    ///
    /// The commit is staged, not applied: the group advances only when
    /// [`Group::apply_commit`] sees it with its event id, so the local commit takes
    /// part in the same tie-break as everyone else's. Any member may commit its own
    /// changes; only inbound proposals are left to the designated committer.
    pub fn commit(&mut self, identity: &Keys, proposals: Vec<Proposal>) -> Result<CommitResult, Error> {
        self.ensure_active()?;
        let state = &self.current;
        let own_leaf = state.own_leaf;

        let leaves_before = state.leaves.clone();
        let (mut leaves, added_leaves) = apply_proposals(&leaves_before, Some(own_leaf), &proposals)?;

        let path_keys = Keys::generate();
        let own = leaves
            .get_mut(own_leaf)
            .ok_or_else(|| Error::InvalidProposal("commit removes the committer".into()))?;
        own.encryption_key = path_keys.public_key();

        let commit_secret: [u8; 32] = crypto::random_bytes()?;
        let ephemeral = Keys::generate();
        let mut secrets = Vec::new();
        for member in leaves.members() {
            if member.leaf_index == own_leaf || added_leaves.contains(&member.leaf_index) {
                continue;
            }
            secrets.push(EncryptedPathSecret {
                leaf_index: member.leaf_index,
                ciphertext: crypto::seal_to(&ephemeral, &member.encryption_key, &commit_secret)?,
            });
        }

        let mut commit = Commit {
            group_id: self.group_id(),
            epoch: self.epoch(),
            committer: own_leaf,
            proposals,
            path: UpdatePath {
                encryption_key: path_keys.public_key(),
                sender_key: ephemeral.public_key(),
                secrets,
            },
            confirmation_tag: String::new(),
            signature: String::new(),
        };

        let digest = commit.content_digest()?;
        let context = state.context.next(leaves.tree_hash()?, &digest);
        let joiner_secret = state.secrets.joiner_secret(&commit_secret);
        let next_secrets = EpochSecrets::derive(joiner_secret.expose(), &context)?;
        commit.confirmation_tag = next_secrets.confirmation_tag(&context)?;
        commit.signature = crypto::sign(identity, &commit.signed_digest()?)?;

        let mut welcomes = Vec::new();
        if !added_leaves.is_empty() {
            let mut info = GroupInfo {
                context: context.clone(),
                leaves: leaves.clone(),
                joiner_secret: joiner_secret.clone(),
                confirmation_tag: commit.confirmation_tag.clone(),
                signer: own_leaf,
                signature: String::new(),
            };
            info.signature = crypto::sign(identity, &info.signed_digest())?;
            let info_bytes = Secret::new(serde_json::to_vec(&info)?);

            let welcome_keys = Keys::generate();
            for proposal in &commit.proposals {
                if let Proposal::Add { key_package } = proposal {
                    welcomes.push((
                        key_package.identity,
                        Welcome {
                            key_package_ref: key_package.reference(),
                            sender_key: welcome_keys.public_key(),
                            group_info: crypto::seal_to(
                                &welcome_keys,
                                &key_package.init_key,
                                info_bytes.expose(),
                            )?,
                        },
                    ));
                }
            }
        }

        self.current.pending_commit = Some(PendingCommit {
            digest: hex::encode(digest),
            commit_secret: Secret::new(commit_secret),
            encryption_secret: crypto::secret_of(&path_keys)?,
        });

        tracing::debug!(
            target: "marmot_group::group",
            epoch = commit.epoch,
            proposals = commit.proposals.len(),
            welcomes = welcomes.len(),
            "Staged commit"
        );

        Ok(CommitResult {
            commit,
            welcomes,
            secrets: NewEpochSecrets {
                epoch: context.epoch,
                epoch_authenticator: next_secrets.epoch_authenticator(),
                exporter_secret: next_secrets.export("exporter", b"")?,
            },
        })
    }

    /// Apply a commit carried by the event `event_id`.
    ///
    /// - A commit for the current epoch advances the group.
    /// - A commit for a later epoch fails with [`Error::EpochMismatch`]; the caller
    ///   resyncs.
    /// - A commit for an epoch the group already left is tie-broken against the
    ///   commit that was applied there: a smaller event id rolls the group back and
    ///   replaces it, otherwise it fails with [`Error::CommitConflict`].
    ///
    /// A group closed by the local member's removal still takes part in the
    /// tie-break for the epoch it was removed in, as long as its snapshots are kept.
    /// A winning commit that keeps the local member reopens the group.
    pub fn apply_commit(
        &mut self,
        commit: &Commit,
        event_id: EventId,
        config: &GroupConfig,
    ) -> Result<CommitOutcome, Error> {
        let removed = self.lifecycle == GroupLifecycle::Closed;
        if removed && self.snapshots.is_empty() {
            return Err(Error::GroupClosed);
        }
        self.check_group(&commit.group_id)?;

        let current = self.epoch();
        match commit.epoch.cmp(&current) {
            std::cmp::Ordering::Greater if removed => Err(Error::GroupClosed),
            std::cmp::Ordering::Greater => Err(Error::EpochMismatch {
                expected: current,
                received: commit.epoch,
            }),
            std::cmp::Ordering::Equal if !removed => self.apply_current(commit, event_id, config),
            _ => self.apply_competing(commit, event_id, config),
        }
    }

    /// Tie-break `commit` against the incumbent of its epoch
    fn apply_competing(
        &mut self,
        commit: &Commit,
        event_id: EventId,
        config: &GroupConfig,
    ) -> Result<CommitOutcome, Error> {
        let removed = self.lifecycle == GroupLifecycle::Closed;
        match self.snapshots.decide(commit.epoch, &event_id) {
            RaceDecision::Duplicate => Err(Error::AlreadyProcessed(event_id)),
            RaceDecision::Reject(applied) => Err(Error::CommitConflict {
                epoch: commit.epoch,
                applied,
            }),
            RaceDecision::Unknown if removed => Err(Error::GroupClosed),
            RaceDecision::Unknown => Err(Error::StaleEpoch(commit.epoch)),
            RaceDecision::Replace => {
                let from = self.epoch();
                let mut candidate = self.clone();
                let mut undone = candidate
                    .snapshots
                    .rollback_to(commit.epoch)
                    .ok_or(Error::StaleEpoch(commit.epoch))?;
                let discarded: Vec<DiscardedCommit> =
                    undone.iter_mut().filter_map(|s| s.own_commit.take()).collect();
                let snapshot = undone.pop_front().ok_or(Error::StaleEpoch(commit.epoch))?;
                candidate.current = snapshot.state;
                candidate.retained = snapshot.retained;
                candidate.lifecycle = GroupLifecycle::Active;
                candidate.removed_at = None;

                let mut outcome = candidate.apply_current(commit, event_id, config)?;
                outcome.rolled_back_from = Some(from);
                outcome.reinstated = removed && !outcome.self_removed;
                outcome.discarded = discarded;
                tracing::info!(
                    target: "marmot_group::group",
                    from_epoch = from,
                    to_epoch = outcome.epoch,
                    reinstated = outcome.reinstated,
                    discarded = outcome.discarded.len(),
                    "Rolled back to apply a winning concurrent commit"
                );
                *self = candidate;
                Ok(outcome)
            }
        }
    }

    fn apply_current(
        &mut self,
        commit: &Commit,
        event_id: EventId,
        config: &GroupConfig,
    ) -> Result<CommitOutcome, Error> {
        let state = &self.current;
        let own_leaf = state.own_leaf;

        let committer = state
            .leaves
            .get(commit.committer)
            .ok_or_else(|| Error::AuthenticationFailure("committer is not a member".into()))?;
        crypto::verify(&committer.identity, &commit.signed_digest()?, &commit.signature)?;

        let (mut leaves, _) = apply_proposals(&state.leaves, Some(commit.committer), &commit.proposals)?;
        let committer_leaf = leaves
            .get_mut(commit.committer)
            .ok_or_else(|| Error::InvalidProposal("commit removes the committer".into()))?;
        committer_leaf.encryption_key = commit.path.encryption_key;

        let added: Vec<PublicKey> = leaves
            .members()
            .filter(|m| state.leaves.get(m.leaf_index).map(|old| old.identity) != Some(m.identity))
            .map(|m| m.identity)
            .collect();
        let removed: Vec<PublicKey> = state
            .leaves
            .members()
            .filter(|m| leaves.get(m.leaf_index).map(|new| new.identity) != Some(m.identity))
            .map(|m| m.identity)
            .collect();

        if leaves.get(own_leaf).map(|m| m.identity) != Some(self.identity) {
            tracing::info!(
                target: "marmot_group::group",
                epoch = state.epoch(),
                "Local member removed; closing group"
            );
            let snapshot = EpochSnapshot {
                epoch: state.epoch(),
                applied_commit_id: event_id,
                state: state.clone(),
                retained: self.retained.clone(),
                own_commit: None,
            };
            self.snapshots.push(snapshot, config.snapshot_retention);
            self.suspend();
            return Ok(CommitOutcome {
                epoch: self.epoch(),
                added,
                removed,
                self_removed: true,
                rolled_back_from: None,
                reinstated: false,
                discarded: Vec::new(),
            });
        }

        let digest = commit.content_digest()?;
        let (commit_secret, own_secret) = if commit.committer == own_leaf {
            let pending = state
                .pending_commit
                .as_ref()
                .filter(|p| p.digest == hex::encode(digest))
                .ok_or_else(|| {
                    Error::AuthenticationFailure(
                        "commit from the local leaf matches no staged commit".into(),
                    )
                })?;
            (pending.commit_secret.clone(), pending.encryption_secret.clone())
        } else {
            let own_secret = match own_update(&commit.proposals, own_leaf) {
                Some(key) => state
                    .pending_updates
                    .get(&key.to_hex())
                    .cloned()
                    .ok_or_else(|| {
                        Error::InvalidProposal("update for the local leaf was not made here".into())
                    })?,
                None => state.own_encryption_secret.clone(),
            };
            let entry = commit
                .path
                .secrets
                .iter()
                .find(|s| s.leaf_index == own_leaf)
                .ok_or_else(|| {
                    Error::AuthenticationFailure("commit carries no secret for the local leaf".into())
                })?;
            let own_keys = crypto::keys_from_secret(own_secret.expose())?;
            let opened = Secret::new(crypto::open_from(
                &own_keys,
                &commit.path.sender_key,
                &entry.ciphertext,
            )?);
            let commit_secret: [u8; 32] = opened
                .expose()
                .as_slice()
                .try_into()
                .map_err(|_| Error::AuthenticationFailure("commit secret has wrong length".into()))?;
            (Secret::new(commit_secret), own_secret)
        };

        let context = state.context.next(leaves.tree_hash()?, &digest);
        let joiner_secret = state.secrets.joiner_secret(commit_secret.expose());
        let secrets = EpochSecrets::derive(joiner_secret.expose(), &context)?;
        secrets.verify_confirmation_tag(&context, &commit.confirmation_tag)?;

        let next = EpochState::new(context, leaves, secrets, own_leaf, own_secret)?;
        let own_commit = (commit.committer == own_leaf).then(|| DiscardedCommit {
            event_id,
            epoch: state.epoch(),
            added: added.clone(),
            removed: removed.clone(),
        });
        let snapshot = EpochSnapshot {
            epoch: state.epoch(),
            applied_commit_id: event_id,
            state: state.clone(),
            retained: self.retained.clone(),
            own_commit,
        };
        self.snapshots.push(snapshot, config.snapshot_retention);

        let previous = std::mem::replace(&mut self.current, next);
        self.retained.push_back(previous);
        while self.retained.len() > config.epoch_retention {
            // dropping an EpochState zeroizes its secrets
            self.retained.pop_front();
        }

        tracing::debug!(
            target: "marmot_group::group",
            epoch = self.epoch(),
            added = added.len(),
            removed = removed.len(),
            "Applied commit"
        );

        Ok(CommitOutcome {
            epoch: self.epoch(),
            added,
            removed,
            self_removed: false,
            rolled_back_from: None,
            reinstated: false,
            discarded: Vec::new(),
        })
    }

    // ------------------------------------------------------------------
    // Application messages
    // ------------------------------------------------------------------

    /// Encrypt under the current epoch
    pub fn encrypt(&mut self, identity: &Keys, plaintext: &[u8]) -> Result<ApplicationMessage, Error> {
        self.ensure_active()?;
        let group_id = self.group_id();
        let epoch = self.epoch();
        let sender = self.own_leaf();

        let (generation, key) = self.current.sending.next()?;
        let aad = ApplicationMessage::aad(&group_id, epoch, sender, generation);
        let content = SignedContent {
            content: BASE64.encode(plaintext),
            signature: crypto::sign(identity, &SignedContent::digest(&aad, plaintext))?,
        };
        let sealed = crypto::seal(
            key.key.expose(),
            &key.nonce,
            &aad,
            &serde_json::to_vec(&content)?,
        )?;

        Ok(ApplicationMessage {
            group_id,
            epoch,
            sender,
            generation,
            ciphertext: BASE64.encode(sealed),
        })
    }

    /// Decrypt a message from the current or a retained epoch
    pub fn decrypt(
        &mut self,
        message: &ApplicationMessage,
        config: &GroupConfig,
    ) -> Result<DecryptedMessage, Error> {
        self.ensure_active()?;
        self.check_group(&message.group_id)?;
        let current = self.epoch();
        if message.epoch > current {
            return Err(Error::EpochMismatch {
                expected: current,
                received: message.epoch,
            });
        }

        let state = if message.epoch == current {
            &mut self.current
        } else {
            self.retained
                .iter_mut()
                .find(|s| s.epoch() == message.epoch)
                .ok_or(Error::StaleEpoch(message.epoch))?
        };

        if message.sender == state.own_leaf {
            return Err(Error::CannotDecryptOwnMessage);
        }
        let sender = state
            .leaves
            .get(message.sender)
            .ok_or_else(|| Error::AuthenticationFailure("sender is not a member of the epoch".into()))?
            .identity;

        // work on a copy so a forged message cannot burn keys
        let mut ratchet = match state.receiving.get(&message.sender) {
            Some(r) => r.clone(),
            None => SenderRatchet::new(state.secrets.encryption.expose(), message.sender)?,
        };
        let key = ratchet.key_for(
            message.generation,
            config.out_of_order_tolerance,
            config.maximum_forward_distance,
        )?;

        let aad = ApplicationMessage::aad(&message.group_id, message.epoch, message.sender, message.generation);
        let sealed = BASE64
            .decode(&message.ciphertext)
            .map_err(|e| Error::AuthenticationFailure(format!("ciphertext encoding: {e}")))?;
        let opened = crypto::open(key.key.expose(), &key.nonce, &aad, &sealed)?;
        let content: SignedContent = serde_json::from_slice(&opened)
            .map_err(|e| Error::AuthenticationFailure(format!("content: {e}")))?;
        let plaintext = BASE64
            .decode(&content.content)
            .map_err(|e| Error::AuthenticationFailure(format!("content encoding: {e}")))?;
        crypto::verify(&sender, &SignedContent::digest(&aad, &plaintext), &content.signature)?;

        state.receiving.insert(message.sender, ratchet);

        Ok(DecryptedMessage {
            group_id: message.group_id,
            epoch: message.epoch,
            sender_leaf: message.sender,
            sender,
            plaintext,
        })
    }
}

fn own_update(proposals: &[Proposal], own_leaf: u32) -> Option<PublicKey> {
    proposals.iter().find_map(|p| match p {
        Proposal::Update {
            leaf_index,
            encryption_key,
        } if *leaf_index == own_leaf => Some(*encryption_key),
        _ => None,
    })
}

/// Validate proposals against `leaves`. `committer` may not be removed or updated
/// by proposal; its key changes through the commit path instead.
fn check_proposals(leaves: &Leaves, committer: Option<u32>, proposals: &[Proposal]) -> Result<(), Error> {
    let mut removed = BTreeSet::new();
    let mut updated = BTreeSet::new();
    let mut joining = BTreeSet::new();

    for proposal in proposals {
        match proposal {
            Proposal::Add { key_package } => {
                key_package.validate()?;
                if leaves.find_identity(&key_package.identity).is_some()
                    || !joining.insert(key_package.identity)
                {
                    return Err(Error::InvalidProposal(format!(
                        "{} is already a member",
                        key_package.identity
                    )));
                }
            }
            Proposal::Remove { leaf_index } => {
                if leaves.get(*leaf_index).is_none() {
                    return Err(Error::InvalidProposal(format!("no member at leaf {leaf_index}")));
                }
                if Some(*leaf_index) == committer {
                    return Err(Error::InvalidProposal("committer cannot remove itself".into()));
                }
                if !removed.insert(*leaf_index) {
                    return Err(Error::InvalidProposal(format!("leaf {leaf_index} removed twice")));
                }
            }
            Proposal::Update { leaf_index, .. } => {
                if leaves.get(*leaf_index).is_none() {
                    return Err(Error::InvalidProposal(format!("no member at leaf {leaf_index}")));
                }
                if Some(*leaf_index) == committer {
                    return Err(Error::InvalidProposal(
                        "committer updates through the commit path".into(),
                    ));
                }
                if !updated.insert(*leaf_index) {
                    return Err(Error::InvalidProposal(format!("leaf {leaf_index} updated twice")));
                }
            }
        }
    }

    if let Some(leaf) = removed.intersection(&updated).next() {
        return Err(Error::InvalidProposal(format!("leaf {leaf} both updated and removed")));
    }
    Ok(())
}

/// Apply proposals to a copy of `leaves`; returns the new slots and the added leaves.
fn apply_proposals(
    leaves: &Leaves,
    committer: Option<u32>,
    proposals: &[Proposal],
) -> Result<(Leaves, BTreeSet<u32>), Error> {
    check_proposals(leaves, committer, proposals)?;

    let mut ordered: Vec<&Proposal> = proposals.iter().collect();
    ordered.sort_by_key(|p| p.apply_order());

    let mut next = leaves.clone();
    let mut added = BTreeSet::new();
    for proposal in ordered {
        match proposal {
            Proposal::Update {
                leaf_index,
                encryption_key,
            } => {
                if let Some(member) = next.get_mut(*leaf_index) {
                    member.encryption_key = *encryption_key;
                }
            }
            Proposal::Remove { leaf_index } => {
                next.remove(*leaf_index);
            }
            Proposal::Add { key_package } => {
                let leaf = next.add(
                    key_package.identity,
                    key_package.init_key,
                    key_package.capabilities.clone(),
                )?;
                added.insert(leaf);
            }
        }
    }
    Ok((next, added))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{event_id, new_member};

    #[test]
    fn test_create_group_at_epoch_zero() {
        let alice = Keys::generate();
        let group = Group::create(&alice, GroupId::from_bytes([1; 32])).unwrap();
        assert_eq!(group.epoch(), 0);
        assert_eq!(group.lifecycle(), GroupLifecycle::Active);
        assert_eq!(group.members().count(), 1);
        assert!(group.is_designated_committer());
        assert_eq!(group.summary().members[0].identity, alice.public_key());
    }

    #[test]
    fn test_propose_remove_missing_member() {
        let alice = Keys::generate();
        let group = Group::create(&alice, GroupId::from_bytes([1; 32])).unwrap();
        assert!(matches!(group.propose_remove(3), Err(Error::InvalidProposal(_))));
    }

    #[test]
    fn test_propose_add_rejects_malformed_key_package() {
        let alice = Keys::generate();
        let group = Group::create(&alice, GroupId::from_bytes([1; 32])).unwrap();
        let (_, bundle) = new_member();
        let mut kp = bundle.key_package;
        kp.signature = "00".repeat(64);
        assert!(matches!(group.propose_add(kp), Err(Error::InvalidProposal(_))));
    }

    #[test]
    fn test_propose_add_existing_member() {
        let alice = Keys::generate();
        let group = Group::create(&alice, GroupId::from_bytes([1; 32])).unwrap();
        let bundle = KeyPackageBundle::generate(&alice, 1).unwrap();
        assert!(matches!(
            group.propose_add(bundle.key_package),
            Err(Error::InvalidProposal(_))
        ));
    }

    #[test]
    fn test_commit_is_staged_until_applied() {
        let config = GroupConfig::default();
        let alice = Keys::generate();
        let mut group = Group::create(&alice, GroupId::from_bytes([1; 32])).unwrap();
        let (_, bundle) = new_member();
        let add = group.propose_add(bundle.key_package).unwrap();

        let result = group.commit(&alice, vec![add]).unwrap();
        assert_eq!(group.epoch(), 0);
        assert_eq!(result.secrets.epoch, 1);
        assert_eq!(result.welcomes.len(), 1);

        let outcome = group.apply_commit(&result.commit, event_id(1), &config).unwrap();
        assert_eq!(outcome.epoch, 1);
        assert_eq!(group.members().count(), 2);
        assert_eq!(group.epoch_authenticator(), result.secrets.epoch_authenticator);
    }

    #[test]
    fn test_future_commit_is_epoch_mismatch() {
        let config = GroupConfig::default();
        let alice = Keys::generate();
        let mut group = Group::create(&alice, GroupId::from_bytes([1; 32])).unwrap();
        let mut commit = group.commit(&alice, vec![]).unwrap().commit;
        commit.epoch = 4;
        assert!(matches!(
            group.apply_commit(&commit, event_id(1), &config),
            Err(Error::EpochMismatch {
                expected: 0,
                received: 4
            })
        ));
    }

    #[test]
    fn test_tampered_commit_fails_authentication() {
        let config = GroupConfig::default();
        let alice = Keys::generate();
        let mut group = Group::create(&alice, GroupId::from_bytes([1; 32])).unwrap();
        let mut commit = group.commit(&alice, vec![]).unwrap().commit;
        commit.confirmation_tag = "00".repeat(32);
        assert!(matches!(
            group.apply_commit(&commit, event_id(1), &config),
            Err(Error::AuthenticationFailure(_))
        ));
        assert_eq!(group.epoch(), 0);
    }

    #[test]
    fn test_wrong_group_rejected() {
        let config = GroupConfig::default();
        let alice = Keys::generate();
        let mut a = Group::create(&alice, GroupId::from_bytes([1; 32])).unwrap();
        let mut b = Group::create(&alice, GroupId::from_bytes([2; 32])).unwrap();
        let commit = a.commit(&alice, vec![]).unwrap().commit;
        assert!(matches!(
            b.apply_commit(&commit, event_id(1), &config),
            Err(Error::WrongGroupId)
        ));
    }

    #[test]
    fn test_closed_group_rejects_everything() {
        let alice = Keys::generate();
        let mut group = Group::create(&alice, GroupId::from_bytes([1; 32])).unwrap();
        group.close();
        assert_eq!(group.lifecycle(), GroupLifecycle::Closed);
        assert!(matches!(group.encrypt(&alice, b"x"), Err(Error::GroupClosed)));
        assert!(matches!(group.propose_update(), Err(Error::GroupClosed)));
    }

    #[test]
    fn test_retained_epochs_are_bounded() {
        let config = GroupConfig {
            epoch_retention: 2,
            ..GroupConfig::default()
        };
        let alice = Keys::generate();
        let mut group = Group::create(&alice, GroupId::from_bytes([1; 32])).unwrap();
        for i in 0..4u8 {
            let commit = group.commit(&alice, vec![]).unwrap().commit;
            group.apply_commit(&commit, event_id(i + 1), &config).unwrap();
        }
        assert_eq!(group.epoch(), 4);
        assert_eq!(group.retained.len(), 2);
        assert_eq!(group.retained.front().map(|s| s.epoch()), Some(2));
    }

    #[test]
    fn test_serde_roundtrip_preserves_state() {
        let alice = Keys::generate();
        let group = Group::create(&alice, GroupId::from_bytes([1; 32])).unwrap();
        let json = serde_json::to_string(&group).unwrap();
        let back: Group = serde_json::from_str(&json).unwrap();
        assert_eq!(back.summary(), group.summary());
    }

    /// Alice's group with bob and carol added in one commit, at epoch 1 everywhere
    fn trio(config: &GroupConfig) -> Vec<(Keys, Group)> {
        let alice = Keys::generate();
        let mut group = Group::create(&alice, GroupId::from_bytes([1; 32])).unwrap();
        let (bob, bob_bundle) = new_member();
        let (carol, carol_bundle) = new_member();
        let proposals = vec![
            group.propose_add(bob_bundle.key_package.clone()).unwrap(),
            group.propose_add(carol_bundle.key_package.clone()).unwrap(),
        ];
        let result = group.commit(&alice, proposals).unwrap();
        group.apply_commit(&result.commit, event_id(0x01), config).unwrap();

        let welcome = |identity: PublicKey| {
            result
                .welcomes
                .iter()
                .find(|(id, _)| *id == identity)
                .map(|(_, w)| w.clone())
                .unwrap()
        };
        let bob_group = Group::join(&bob, &bob_bundle, &welcome(bob.public_key())).unwrap();
        let carol_group = Group::join(&carol, &carol_bundle, &welcome(carol.public_key())).unwrap();
        vec![(alice, group), (bob, bob_group), (carol, carol_group)]
    }

    fn leaf_of(group: &Group, identity: &Keys) -> u32 {
        group
            .members()
            .find(|m| m.identity == identity.public_key())
            .map(|m| m.leaf_index)
            .unwrap()
    }

    #[test]
    fn test_removal_that_loses_the_race_is_undone() {
        let config = GroupConfig::default();
        let mut members = trio(&config);
        let (carol, mut carol_group) = members.pop().unwrap();
        let (bob, mut bob_group) = members.pop().unwrap();
        let (alice, mut alice_group) = members.pop().unwrap();

        let remove_bob = alice_group.propose_remove(leaf_of(&alice_group, &bob)).unwrap();
        let removal = alice_group.commit(&alice, vec![remove_bob]).unwrap().commit;
        let winner = carol_group.commit(&carol, vec![]).unwrap().commit;

        let removed = bob_group.apply_commit(&removal, event_id(0xb0), &config).unwrap();
        assert!(removed.self_removed);
        assert_eq!(bob_group.lifecycle(), GroupLifecycle::Closed);
        assert!(matches!(bob_group.encrypt(&bob, b"x"), Err(Error::GroupClosed)));
        assert_eq!(
            bob_group.apply_commit(&removal, event_id(0xb0), &config),
            Err(Error::AlreadyProcessed(event_id(0xb0)))
        );

        let outcome = bob_group.apply_commit(&winner, event_id(0xa0), &config).unwrap();
        assert!(outcome.reinstated);
        assert!(!outcome.self_removed);
        assert_eq!(outcome.epoch, 2);
        assert_eq!(bob_group.lifecycle(), GroupLifecycle::Active);

        alice_group.apply_commit(&removal, event_id(0xb0), &config).unwrap();
        alice_group.apply_commit(&winner, event_id(0xa0), &config).unwrap();
        carol_group.apply_commit(&winner, event_id(0xa0), &config).unwrap();
        assert_eq!(bob_group.epoch_authenticator(), alice_group.epoch_authenticator());
        assert_eq!(bob_group.epoch_authenticator(), carol_group.epoch_authenticator());
        assert_eq!(bob_group.members().count(), 3);

        let message = carol_group.encrypt(&carol, b"still here").unwrap();
        assert_eq!(bob_group.decrypt(&message, &config).unwrap().plaintext, b"still here");
    }

    #[test]
    fn test_removal_that_wins_the_race_stays_closed() {
        let config = GroupConfig::default();
        let mut members = trio(&config);
        let (carol, mut carol_group) = members.pop().unwrap();
        let (bob, mut bob_group) = members.pop().unwrap();
        let (alice, mut alice_group) = members.pop().unwrap();

        let remove_bob = alice_group.propose_remove(leaf_of(&alice_group, &bob)).unwrap();
        let removal = alice_group.commit(&alice, vec![remove_bob]).unwrap().commit;
        let loser = carol_group.commit(&carol, vec![]).unwrap().commit;

        bob_group.apply_commit(&removal, event_id(0x10), &config).unwrap();
        assert_eq!(
            bob_group.apply_commit(&loser, event_id(0x90), &config),
            Err(Error::CommitConflict {
                epoch: 1,
                applied: event_id(0x10)
            })
        );
        assert_eq!(bob_group.lifecycle(), GroupLifecycle::Closed);

        // once the removal is final nothing reopens the group
        bob_group.close();
        assert_eq!(
            bob_group.apply_commit(&loser, event_id(0x01), &config),
            Err(Error::GroupClosed)
        );
    }

    #[test]
    fn test_rolled_back_local_commit_is_reported() {
        let config = GroupConfig::default();
        let mut members = trio(&config);
        let (carol, mut carol_group) = members.pop().unwrap();
        let (bob, _) = members.pop().unwrap();
        let (alice, mut alice_group) = members.pop().unwrap();

        let remove_bob = alice_group.propose_remove(leaf_of(&alice_group, &bob)).unwrap();
        let own = alice_group.commit(&alice, vec![remove_bob]).unwrap().commit;
        let winner = carol_group.commit(&carol, vec![]).unwrap().commit;

        let applied = alice_group.apply_commit(&own, event_id(0x90), &config).unwrap();
        assert!(applied.discarded.is_empty());
        let outcome = alice_group.apply_commit(&winner, event_id(0x20), &config).unwrap();
        assert_eq!(outcome.rolled_back_from, Some(2));
        assert_eq!(
            outcome.discarded,
            vec![DiscardedCommit {
                event_id: event_id(0x90),
                epoch: 1,
                added: Vec::new(),
                removed: vec![bob.public_key()],
            }]
        );
        assert_eq!(alice_group.members().count(), 3);

        // where the winner arrived first the loser is simply rejected
        carol_group.apply_commit(&winner, event_id(0x20), &config).unwrap();
        let outcome = carol_group.apply_commit(&own, event_id(0x90), &config);
        assert!(matches!(outcome, Err(Error::CommitConflict { .. })));
    }
}
