//! Epoch snapshots for commit race resolution.
//!
//! Nostr gives no delivery order, so two members can commit against the same epoch
//! and different peers see them in different orders. Every applied commit first
//! snapshots the pre-commit state. When a competing commit for an already-advanced
//! epoch arrives, the event ids decide: the lexicographically smallest id wins, and
//! a late winner rolls the group back to the snapshot before it is applied.
//!
//! A commit that removes the local member is snapshotted too, so a removal that
//! loses its race can still be undone while the snapshot is kept.

use std::collections::VecDeque;
use std::fmt;

use nostr::EventId;
use serde::{Deserialize, Serialize};

use crate::group::{DiscardedCommit, EpochState};

/// State captured before a commit was applied
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct EpochSnapshot {
    /// The epoch *before* the commit was applied
    pub epoch: u64,
    /// The commit applied after this snapshot was taken (the incumbent)
    pub applied_commit_id: EventId,
    pub state: EpochState,
    pub retained: VecDeque<EpochState>,
    /// Set when the incumbent was committed by the local member
    #[serde(default)]
    pub own_commit: Option<DiscardedCommit>,
}

impl fmt::Debug for EpochSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EpochSnapshot {{ epoch: {}, applied_commit_id: {}, state: [REDACTED] }}",
            self.epoch, self.applied_commit_id
        )
    }
}

/// What to do with a commit for an epoch the group already left
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RaceDecision {
    /// Same event as the incumbent
    Duplicate,
    /// The candidate sorts first: roll back and apply it
    Replace,
    /// The incumbent sorts first
    Reject(EventId),
    /// No snapshot covers the epoch
    Unknown,
}

/// Bounded queue of snapshots, oldest first
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct EpochSnapshots(VecDeque<EpochSnapshot>);

impl EpochSnapshots {
    /// Record a snapshot, dropping the oldest beyond `retention`
    pub fn push(&mut self, snapshot: EpochSnapshot, retention: usize) {
        self.0.push_back(snapshot);
        while self.0.len() > retention {
            self.0.pop_front();
        }
    }

    /// Compare a candidate commit for `epoch` against the incumbent
    pub fn decide(&self, epoch: u64, candidate: &EventId) -> RaceDecision {
        let Some(snapshot) = self.0.iter().find(|s| s.epoch == epoch) else {
            return RaceDecision::Unknown;
        };
        if &snapshot.applied_commit_id == candidate {
            RaceDecision::Duplicate
        } else if candidate.to_hex() < snapshot.applied_commit_id.to_hex() {
            RaceDecision::Replace
        } else {
            RaceDecision::Reject(snapshot.applied_commit_id)
        }
    }

    /// Remove the snapshot for `epoch` and every later one, oldest first
    pub fn rollback_to(&mut self, epoch: u64) -> Option<VecDeque<EpochSnapshot>> {
        let index = self.0.iter().position(|s| s.epoch == epoch)?;
        Some(self.0.split_off(index))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

#[cfg(test)]
mod tests {
    use nostr::Keys;

    use super::*;
    use crate::group::Group;
    use marmot_storage_traits::GroupId;

    fn event_id(byte: u8) -> EventId {
        EventId::from_slice(&[byte; 32]).unwrap()
    }

    fn snapshot(epoch: u64, id: u8) -> EpochSnapshot {
        let group = Group::create(&Keys::generate(), GroupId::from_bytes([1; 32])).unwrap();
        EpochSnapshot {
            epoch,
            applied_commit_id: event_id(id),
            state: group.current_state().clone(),
            retained: VecDeque::new(),
            own_commit: None,
        }
    }

    #[test]
    fn test_decide() {
        let mut snapshots = EpochSnapshots::default();
        snapshots.push(snapshot(3, 0x50), 5);

        assert_eq!(snapshots.decide(3, &event_id(0x50)), RaceDecision::Duplicate);
        assert_eq!(snapshots.decide(3, &event_id(0x10)), RaceDecision::Replace);
        assert_eq!(
            snapshots.decide(3, &event_id(0x90)),
            RaceDecision::Reject(event_id(0x50))
        );
        assert_eq!(snapshots.decide(2, &event_id(0x10)), RaceDecision::Unknown);
    }

    #[test]
    fn test_retention() {
        let mut snapshots = EpochSnapshots::default();
        for epoch in 0..4 {
            snapshots.push(snapshot(epoch, epoch as u8), 2);
        }
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots.decide(0, &event_id(9)), RaceDecision::Unknown);
        assert_eq!(snapshots.decide(3, &event_id(3)), RaceDecision::Duplicate);
    }

    #[test]
    fn test_rollback_discards_later_snapshots() {
        let mut snapshots = EpochSnapshots::default();
        for epoch in 0..3 {
            snapshots.push(snapshot(epoch, epoch as u8 + 1), 5);
        }
        let undone = snapshots.rollback_to(1).unwrap();
        assert_eq!(undone.iter().map(|s| s.epoch).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(snapshots.len(), 1);
        assert!(snapshots.rollback_to(2).is_none());
    }

    #[test]
    fn test_debug_redacts_state() {
        let debug = format!("{:?}", snapshot(1, 1));
        assert!(debug.contains("[REDACTED]"));
    }
}
