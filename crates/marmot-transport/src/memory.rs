//! In-memory relay
//!
//! Shared by every client of one test network: stores events, answers
//! subscriptions from storage and then live, and has knobs to go offline or
//! refuse a kind.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr::filter::MatchEventOptions;
use nostr::{Event, EventId, Filter, Kind};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::RelayError;
use crate::relay::Relay;

#[derive(Default)]
struct State {
    events: Vec<Event>,
    event_ids: HashSet<EventId>,
    subscriptions: Vec<(Filter, mpsc::UnboundedSender<Event>)>,
    offline: bool,
    rejected_kinds: HashSet<Kind>,
    publish_attempts: usize,
}

/// An in-memory relay
#[derive(Clone)]
pub struct MemoryRelay {
    url: String,
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for MemoryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRelay").field("url", &self.url).finish()
    }
}

impl MemoryRelay {
    /// New empty relay
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Take the relay offline (every operation fails) or back online
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Refuse events of `kind`
    pub fn reject_kind(&self, kind: Kind) {
        self.state.lock().rejected_kinds.insert(kind);
    }

    /// Every stored event, in publish order
    pub fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    /// Publish attempts seen, accepted or not
    pub fn publish_attempts(&self) -> usize {
        self.state.lock().publish_attempts
    }

    fn unreachable(&self) -> RelayError {
        RelayError::Unreachable {
            url: self.url.clone(),
            reason: "connection refused".to_string(),
        }
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    fn url(&self) -> &str {
        &self.url
    }

    async fn publish(&self, event: &Event) -> Result<(), RelayError> {
        let mut state = self.state.lock();
        state.publish_attempts += 1;
        if state.offline {
            return Err(self.unreachable());
        }
        if state.rejected_kinds.contains(&event.kind) {
            return Err(RelayError::Rejected {
                url: self.url.clone(),
                reason: format!("blocked: kind {}", event.kind.as_u16()),
            });
        }
        if event.verify().is_err() {
            return Err(RelayError::Rejected {
                url: self.url.clone(),
                reason: "invalid: bad signature".to_string(),
            });
        }
        // duplicates are acknowledged but not stored or fanned out twice
        if !state.event_ids.insert(event.id) {
            return Ok(());
        }
        state.events.push(event.clone());
        state.subscriptions.retain(|(filter, tx)| {
            if filter.match_event(event, MatchEventOptions::new()) {
                tx.send(event.clone()).is_ok()
            } else {
                !tx.is_closed()
            }
        });
        Ok(())
    }

    async fn subscribe(&self, filter: Filter) -> Result<mpsc::UnboundedReceiver<Event>, RelayError> {
        let mut state = self.state.lock();
        if state.offline {
            return Err(self.unreachable());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for event in state
            .events
            .iter()
            .filter(|e| filter.match_event(e, MatchEventOptions::new()))
        {
            let _ = tx.send(event.clone());
        }
        state.subscriptions.push((filter, tx));
        Ok(rx)
    }

    async fn fetch(&self, filter: Filter, _timeout: Duration) -> Result<Vec<Event>, RelayError> {
        let state = self.state.lock();
        if state.offline {
            return Err(self.unreachable());
        }
        Ok(state
            .events
            .iter()
            .filter(|e| filter.match_event(e, MatchEventOptions::new()))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use nostr::{EventBuilder, Keys};

    use super::*;

    fn note(content: &str) -> Event {
        EventBuilder::new(Kind::TextNote, content)
            .sign_with_keys(&Keys::generate())
            .unwrap()
    }

    #[tokio::test]
    async fn test_stored_then_live() {
        let relay = MemoryRelay::new("memory://a");
        let first = note("first");
        relay.publish(&first).await.unwrap();

        let mut rx = relay.subscribe(Filter::new().kind(Kind::TextNote)).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, first.id);

        let second = note("second");
        relay.publish(&second).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, second.id);
    }

    #[tokio::test]
    async fn test_fetch_returns_stored_matches() {
        let relay = MemoryRelay::new("memory://a");
        let event = note("stored");
        relay.publish(&event).await.unwrap();

        let fetched = relay
            .fetch(Filter::new().kind(Kind::TextNote), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(fetched, vec![event]);
        assert!(
            relay
                .fetch(Filter::new().kind(Kind::Metadata), Duration::from_secs(1))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_duplicate_publish_stored_once() {
        let relay = MemoryRelay::new("memory://a");
        let event = note("once");
        relay.publish(&event).await.unwrap();
        relay.publish(&event).await.unwrap();
        assert_eq!(relay.events().len(), 1);
        assert_eq!(relay.publish_attempts(), 2);
    }

    #[tokio::test]
    async fn test_offline_and_rejecting() {
        let relay = MemoryRelay::new("memory://a");
        relay.set_offline(true);
        assert!(matches!(
            relay.publish(&note("x")).await,
            Err(RelayError::Unreachable { .. })
        ));
        relay.set_offline(false);
        relay.reject_kind(Kind::TextNote);
        assert!(matches!(
            relay.publish(&note("x")).await,
            Err(RelayError::Rejected { .. })
        ));
    }
}
