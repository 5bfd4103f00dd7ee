//! Persisted conversation sessions
//!
//! One record per conversation: the group it maps to, the epoch it joined at,
//! the last epoch and `created_at` it processed, and a bounded list of recently
//! handled event ids. Replay after a restart starts from the `created_at`
//! watermark; the recent ids keep a replayed event from being handled twice.
//!
//! Updates change the in-memory records at once and hand the serialized file to
//! a writer task, which writes the newest version with `tokio::fs`. Versions
//! superseded before the writer gets to them are skipped. [`SessionStore::flush`]
//! waits until everything recorded so far is on disk.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use marmot_storage_traits::GroupId;
use nostr::{EventId, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::Error;

/// Session file name inside the state dir
pub const SESSIONS_FILE: &str = "sessions_v1.json";
/// Recently handled event ids kept per session
pub const RECENT_EVENT_IDS_MAX: usize = 1024;

/// One conversation's session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Host conversation id
    pub conversation_id: String,
    /// Group the conversation maps to
    pub group_id: GroupId,
    /// Epoch the local member entered the group at
    pub joined_epoch: u64,
    /// Last epoch seen applied
    pub last_epoch: u64,
    /// `created_at` (unix seconds) of the newest handled event
    #[serde(default)]
    pub last_created_at: Option<u64>,
    /// Recently handled event ids, oldest first
    #[serde(default)]
    pub recent_event_ids: VecDeque<EventId>,
}

impl SessionRecord {
    /// Fresh session
    pub fn new(conversation_id: impl Into<String>, group_id: GroupId, epoch: u64) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            group_id,
            joined_epoch: epoch,
            last_epoch: epoch,
            last_created_at: None,
            recent_event_ids: VecDeque::new(),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionsFile {
    #[serde(default)]
    sessions: Vec<SessionRecord>,
    /// `created_at` of the newest processed welcome
    #[serde(default)]
    welcome_since: Option<u64>,
    /// Bumped on every change
    #[serde(skip)]
    version: u64,
}

/// Serialized file waiting for the writer
#[derive(Debug, Clone, Default)]
struct PendingWrite {
    version: u64,
    contents: Arc<Vec<u8>>,
}

/// Newest version the writer finished with
#[derive(Debug, Clone, Default)]
struct WriteStatus {
    version: u64,
    error: Option<String>,
}

/// Session records backed by `sessions_v1.json`
#[derive(Debug)]
pub struct SessionStore {
    state: Mutex<SessionsFile>,
    pending: watch::Sender<PendingWrite>,
    written: watch::Receiver<WriteStatus>,
}

impl SessionStore {
    /// Load the store from `state_dir`, starting empty if the file is missing,
    /// and start its writer task
    pub async fn load(state_dir: &Path) -> Result<Self, Error> {
        tokio::fs::create_dir_all(state_dir).await?;
        let path = state_dir.join(SESSIONS_FILE);
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionsFile::default(),
            Err(e) => return Err(e.into()),
        };

        let (pending, pending_rx) = watch::channel(PendingWrite::default());
        let (written_tx, written) = watch::channel(WriteStatus::default());
        tokio::spawn(write_sessions(path, pending_rx, written_tx));
        Ok(Self {
            state: Mutex::new(state),
            pending,
            written,
        })
    }

    /// Wait until every change made so far has been written
    pub async fn flush(&self) -> Result<(), Error> {
        let target = self.state.lock().version;
        let mut written = self.written.clone();
        let status = written
            .wait_for(|status| status.version >= target)
            .await
            .map_err(|_| Error::State("session writer stopped".to_string()))?;
        match &status.error {
            Some(e) => Err(Error::State(format!("cannot write {SESSIONS_FILE}: {e}"))),
            None => Ok(()),
        }
    }

    /// Every record
    pub fn records(&self) -> Vec<SessionRecord> {
        self.state.lock().sessions.clone()
    }

    /// Record for `group_id`
    pub fn record(&self, group_id: &GroupId) -> Option<SessionRecord> {
        self.state
            .lock()
            .sessions
            .iter()
            .find(|s| s.group_id == *group_id)
            .cloned()
    }

    /// Group a conversation maps to
    pub fn group_for(&self, conversation_id: &str) -> Option<GroupId> {
        self.state
            .lock()
            .sessions
            .iter()
            .find(|s| s.conversation_id == conversation_id)
            .map(|s| s.group_id)
    }

    /// Conversation a group maps to; the group id hex when it has no session
    pub fn conversation_for(&self, group_id: &GroupId) -> String {
        self.state
            .lock()
            .sessions
            .iter()
            .find(|s| s.group_id == *group_id)
            .map(|s| s.conversation_id.clone())
            .unwrap_or_else(|| group_id.to_hex())
    }

    /// Add a session. Fails if the conversation is taken by another group;
    /// re-adding the same mapping keeps the existing record.
    pub fn insert(&self, record: SessionRecord) -> Result<(), Error> {
        let mut state = self.state.lock();
        if let Some(existing) = state
            .sessions
            .iter()
            .find(|s| s.conversation_id == record.conversation_id)
        {
            if existing.group_id == record.group_id {
                return Ok(());
            }
            return Err(Error::ConversationExists(record.conversation_id));
        }
        state.sessions.push(record);
        self.persist(&mut state)
    }

    /// Drop the session of a conversation
    pub fn remove(&self, conversation_id: &str) -> Result<Option<SessionRecord>, Error> {
        let mut state = self.state.lock();
        let Some(pos) = state
            .sessions
            .iter()
            .position(|s| s.conversation_id == conversation_id)
        else {
            return Ok(None);
        };
        let record = state.sessions.remove(pos);
        self.persist(&mut state)?;
        Ok(Some(record))
    }

    /// Whether `event_id` was handled for `group_id`
    pub fn is_handled(&self, group_id: &GroupId, event_id: &EventId) -> bool {
        self.state
            .lock()
            .sessions
            .iter()
            .find(|s| s.group_id == *group_id)
            .is_some_and(|s| s.recent_event_ids.contains(event_id))
    }

    /// Record a handled event and advance the watermark
    pub fn mark_handled(
        &self,
        group_id: &GroupId,
        event_id: EventId,
        created_at: Timestamp,
    ) -> Result<(), Error> {
        let mut state = self.state.lock();
        let Some(session) = state.sessions.iter_mut().find(|s| s.group_id == *group_id) else {
            return Ok(());
        };
        if !session.recent_event_ids.contains(&event_id) {
            session.recent_event_ids.push_back(event_id);
            while session.recent_event_ids.len() > RECENT_EVENT_IDS_MAX {
                session.recent_event_ids.pop_front();
            }
        }
        let created_at = created_at.as_secs();
        session.last_created_at = Some(session.last_created_at.map_or(created_at, |t| t.max(created_at)));
        self.persist(&mut state)
    }

    /// Remember the group's latest epoch
    pub fn set_epoch(&self, group_id: &GroupId, epoch: u64) -> Result<(), Error> {
        let mut state = self.state.lock();
        let Some(session) = state.sessions.iter_mut().find(|s| s.group_id == *group_id) else {
            return Ok(());
        };
        if session.last_epoch == epoch {
            return Ok(());
        }
        session.last_epoch = epoch;
        self.persist(&mut state)
    }

    /// Replay start for a group: the watermark minus `lookback`, or everything
    /// when nothing was handled yet
    pub fn replay_since(&self, group_id: &GroupId, lookback: Duration) -> Option<Timestamp> {
        let state = self.state.lock();
        let last = state
            .sessions
            .iter()
            .find(|s| s.group_id == *group_id)?
            .last_created_at?;
        Some(Timestamp::from_secs(last.saturating_sub(lookback.as_secs())))
    }

    /// Start the watermark of a group at `created_at` without handling an event
    pub fn start_watermark(&self, group_id: &GroupId, created_at: Timestamp) -> Result<(), Error> {
        let mut state = self.state.lock();
        let Some(session) = state.sessions.iter_mut().find(|s| s.group_id == *group_id) else {
            return Ok(());
        };
        if session.last_created_at.is_some() {
            return Ok(());
        }
        session.last_created_at = Some(created_at.as_secs());
        self.persist(&mut state)
    }

    /// Welcome subscription start
    pub fn welcome_since(&self, lookback: Duration) -> Option<Timestamp> {
        self.state
            .lock()
            .welcome_since
            .map(|t| Timestamp::from_secs(t.saturating_sub(lookback.as_secs())))
    }

    /// Advance the welcome watermark
    pub fn mark_welcome(&self, created_at: Timestamp) -> Result<(), Error> {
        let mut state = self.state.lock();
        let created_at = created_at.as_secs();
        state.welcome_since = Some(state.welcome_since.map_or(created_at, |t| t.max(created_at)));
        self.persist(&mut state)
    }

    /// Queue the current state for the writer
    fn persist(&self, state: &mut SessionsFile) -> Result<(), Error> {
        let contents = Arc::new(serde_json::to_vec_pretty(&*state)?);
        state.version += 1;
        self.pending.send_replace(PendingWrite {
            version: state.version,
            contents,
        });
        Ok(())
    }
}

/// Write the newest queued version until the store is dropped
async fn write_sessions(
    path: PathBuf,
    mut pending: watch::Receiver<PendingWrite>,
    written: watch::Sender<WriteStatus>,
) {
    loop {
        let closed = pending.changed().await.is_err();
        let next = pending.borrow_and_update().clone();
        if next.version > written.borrow().version {
            let error = write_atomic(&path, &next.contents).await.err().map(|e| e.to_string());
            if let Some(e) = &error {
                tracing::warn!(target: "marmot_channel::sessions", "Failed to write {SESSIONS_FILE}: {e}");
            }
            written.send_replace(WriteStatus {
                version: next.version,
                error,
            });
        }
        if closed {
            break;
        }
    }
}

/// Write to a temp file and rename over the old one
async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, contents).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn event_id(byte: u8) -> EventId {
        EventId::from_slice(&[byte; 32]).unwrap()
    }

    #[tokio::test]
    async fn test_sessions_survive_reload() {
        let dir = TempDir::new().unwrap();
        let group = GroupId::from_bytes([1; 32]);
        {
            let store = SessionStore::load(dir.path()).await.unwrap();
            store.insert(SessionRecord::new("chat", group, 0)).unwrap();
            store
                .mark_handled(&group, event_id(7), Timestamp::from_secs(1_000))
                .unwrap();
            store.set_epoch(&group, 3).unwrap();
            store.mark_welcome(Timestamp::from_secs(500)).unwrap();
            store.flush().await.unwrap();
        }

        let store = SessionStore::load(dir.path()).await.unwrap();
        assert_eq!(store.group_for("chat"), Some(group));
        assert_eq!(store.conversation_for(&group), "chat");
        assert!(store.is_handled(&group, &event_id(7)));
        assert_eq!(store.record(&group).unwrap().last_epoch, 3);
        assert_eq!(
            store.replay_since(&group, Duration::from_secs(60)),
            Some(Timestamp::from_secs(940))
        );
        assert_eq!(
            store.welcome_since(Duration::from_secs(60)),
            Some(Timestamp::from_secs(440))
        );
    }

    #[tokio::test]
    async fn test_conversation_maps_to_one_group() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::load(dir.path()).await.unwrap();
        let a = GroupId::from_bytes([1; 32]);
        let b = GroupId::from_bytes([2; 32]);
        store.insert(SessionRecord::new("chat", a, 0)).unwrap();
        store.insert(SessionRecord::new("chat", a, 0)).unwrap();
        assert!(matches!(
            store.insert(SessionRecord::new("chat", b, 0)),
            Err(Error::ConversationExists(_))
        ));
        assert_eq!(store.records().len(), 1);
        assert_eq!(store.conversation_for(&b), b.to_hex());
    }

    #[tokio::test]
    async fn test_recent_ids_are_bounded() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::load(dir.path()).await.unwrap();
        let group = GroupId::from_bytes([1; 32]);
        store.insert(SessionRecord::new("chat", group, 0)).unwrap();
        for i in 0..=RECENT_EVENT_IDS_MAX as u32 {
            let mut bytes = [0u8; 32];
            bytes[..4].copy_from_slice(&i.to_be_bytes());
            store
                .mark_handled(&group, EventId::from_byte_array(bytes), Timestamp::from_secs(u64::from(i)))
                .unwrap();
        }
        let record = store.record(&group).unwrap();
        assert_eq!(record.recent_event_ids.len(), RECENT_EVENT_IDS_MAX);
        assert!(!store.is_handled(&group, &EventId::from_byte_array([0; 32])));
        assert_eq!(record.last_created_at, Some(RECENT_EVENT_IDS_MAX as u64));
    }

    #[tokio::test]
    async fn test_no_watermark_replays_everything() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::load(dir.path()).await.unwrap();
        let group = GroupId::from_bytes([1; 32]);
        store.insert(SessionRecord::new("chat", group, 0)).unwrap();
        assert_eq!(store.replay_since(&group, Duration::from_secs(60)), None);
        store.start_watermark(&group, Timestamp::from_secs(100)).unwrap();
        assert_eq!(
            store.replay_since(&group, Duration::from_secs(60)),
            Some(Timestamp::from_secs(40))
        );
        assert_eq!(store.remove("chat").unwrap().map(|r| r.group_id), Some(group));
        assert_eq!(store.group_for("chat"), None);
    }

    #[tokio::test]
    async fn test_flush_writes_latest_version_only() {
        let dir = TempDir::new().unwrap();
        let group = GroupId::from_bytes([1; 32]);
        let store = SessionStore::load(dir.path()).await.unwrap();
        store.flush().await.unwrap();
        assert!(!dir.path().join(SESSIONS_FILE).exists());

        store.insert(SessionRecord::new("chat", group, 0)).unwrap();
        for epoch in 1..=50 {
            store.set_epoch(&group, epoch).unwrap();
        }
        store.flush().await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join(SESSIONS_FILE)).unwrap();
        let file: SessionsFile = serde_json::from_str(&raw).unwrap();
        assert_eq!(file.sessions[0].last_epoch, 50);
        assert!(!dir.path().join("sessions_v1.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_flush_reports_write_failure() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::load(dir.path()).await.unwrap();
        // a directory where the file should go makes the rename fail
        std::fs::create_dir(dir.path().join(SESSIONS_FILE)).unwrap();
        std::fs::write(dir.path().join(SESSIONS_FILE).join("blocker"), b"x").unwrap();
        store.mark_welcome(Timestamp::from_secs(1)).unwrap();
        assert!(matches!(store.flush().await, Err(Error::State(_))));
    }
}
