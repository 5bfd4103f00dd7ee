//! Publish fan-out and deduplicated subscriptions

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use futures::stream::{FuturesUnordered, StreamExt};
use nostr::{Event, Filter};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::TransportConfig;
use crate::dedup::DedupWindow;
use crate::error::{Error, RelayError};
use crate::relay::Relay;

/// The relay set one process publishes to and reads from
#[derive(Clone)]
pub struct Transport {
    relays: Vec<Arc<dyn Relay>>,
    config: TransportConfig,
    seen: Arc<Mutex<DedupWindow>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("relays", &self.relays.iter().map(|r| r.url()).collect::<Vec<_>>())
            .field("config", &self.config)
            .finish()
    }
}

impl Transport {
    /// Transport over `relays`
    pub fn new(relays: Vec<Arc<dyn Relay>>, config: TransportConfig) -> Self {
        let capacity = NonZeroUsize::new(config.dedup_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            relays,
            config,
            seen: Arc::new(Mutex::new(DedupWindow::new(capacity))),
        }
    }

    /// Relay urls
    pub fn relay_urls(&self) -> Vec<String> {
        self.relays.iter().map(|r| r.url().to_string()).collect()
    }

    /// Publish to every relay concurrently.
    ///
    /// Returns the url of the first relay that acknowledged the event. Relays still
    /// retrying keep going in the background. Fails with [`Error::DeliveryFailed`]
    /// once every relay has exhausted its attempts; the event is then left out of
    /// the dedup window, so a copy that reaches a relay later is still delivered.
    pub async fn publish(&self, event: &Event) -> Result<String, Error> {
        if self.relays.is_empty() {
            return Err(Error::NoRelays);
        }
        // our own events never come back to us through a subscription, unless
        // no relay took them
        let newly_seen = self.seen.lock().insert(event.id);

        let mut attempts: FuturesUnordered<JoinHandle<Result<String, RelayError>>> = self
            .relays
            .iter()
            .map(|relay| {
                let relay = Arc::clone(relay);
                let event = event.clone();
                let config = self.config.clone();
                tokio::spawn(async move { publish_with_retry(relay, event, config).await })
            })
            .collect();

        let mut failures = Vec::new();
        while let Some(joined) = attempts.next().await {
            match joined {
                Ok(Ok(url)) => {
                    tracing::debug!(target: "marmot_transport", event_id = %event.id, %url, "Event acknowledged");
                    return Ok(url);
                }
                Ok(Err(e)) => failures.push(e),
                Err(e) => failures.push(RelayError::Unreachable {
                    url: String::new(),
                    reason: format!("publish task failed: {e}"),
                }),
            }
        }
        if newly_seen {
            self.seen.lock().remove(&event.id);
        }
        tracing::warn!(target: "marmot_transport", event_id = %event.id, "No relay acknowledged event");
        Err(Error::DeliveryFailed(failures))
    }

    /// Subscribe on every relay and merge the results into one deduplicated stream.
    ///
    /// Events already delivered by this transport (including through earlier
    /// subscriptions) are not delivered again while they remain in the dedup window.
    pub async fn subscribe(&self, filter: Filter) -> Result<Subscription, Error> {
        if self.relays.is_empty() {
            return Err(Error::NoRelays);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut forwarders = Vec::new();
        let mut failures = Vec::new();

        for relay in &self.relays {
            match relay.subscribe(filter.clone()).await {
                Ok(mut events) => {
                    let tx = tx.clone();
                    let seen = Arc::clone(&self.seen);
                    forwarders.push(tokio::spawn(async move {
                        while let Some(event) = events.recv().await {
                            if !seen.lock().insert(event.id) {
                                continue;
                            }
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                    }));
                }
                Err(e) => {
                    tracing::warn!(target: "marmot_transport", "Subscribe failed: {e}");
                    failures.push(e);
                }
            }
        }

        if forwarders.is_empty() {
            return Err(Error::SubscribeFailed(failures));
        }
        Ok(Subscription { rx, forwarders })
    }

    /// Query stored events from every relay.
    ///
    /// Results are merged and ordered by `created_at` then id. The dedup window is
    /// neither consulted nor updated, so replay can see events a subscription
    /// already delivered. Fails only when no relay answers.
    pub async fn fetch(&self, filter: Filter) -> Result<Vec<Event>, Error> {
        if self.relays.is_empty() {
            return Err(Error::NoRelays);
        }
        let timeout = self.config.fetch_timeout;
        let mut queries: FuturesUnordered<_> = self
            .relays
            .iter()
            .map(|relay| {
                let filter = filter.clone();
                async move {
                    match tokio::time::timeout(timeout, relay.fetch(filter, timeout)).await {
                        Ok(result) => result,
                        Err(_) => Err(RelayError::Timeout {
                            url: relay.url().to_string(),
                        }),
                    }
                }
            })
            .collect();

        let mut answered = false;
        let mut failures = Vec::new();
        let mut ids = HashSet::new();
        let mut events = Vec::new();
        while let Some(result) = queries.next().await {
            match result {
                Ok(batch) => {
                    answered = true;
                    events.extend(batch.into_iter().filter(|e| ids.insert(e.id)));
                }
                Err(e) => {
                    tracing::warn!(target: "marmot_transport", "Fetch failed: {e}");
                    failures.push(e);
                }
            }
        }
        if !answered {
            return Err(Error::FetchFailed(failures));
        }
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(events)
    }
}

async fn publish_with_retry(
    relay: Arc<dyn Relay>,
    event: Event,
    config: TransportConfig,
) -> Result<String, RelayError> {
    let url = relay.url().to_string();
    let mut backoff = config.initial_backoff;
    let mut last = RelayError::Timeout { url: url.clone() };

    for attempt in 1..=config.max_attempts.max(1) {
        match tokio::time::timeout(config.publish_timeout, relay.publish(&event)).await {
            Ok(Ok(())) => return Ok(url),
            // a refusal is the relay's policy; retrying won't change it
            Ok(Err(e @ RelayError::Rejected { .. })) => return Err(e),
            Ok(Err(e)) => last = e,
            Err(_) => last = RelayError::Timeout { url: url.clone() },
        }
        if attempt < config.max_attempts {
            tracing::debug!(target: "marmot_transport", %url, attempt, ?backoff, "Retrying publish");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(config.max_backoff);
        }
    }
    Err(last)
}

/// A merged, deduplicated event stream. Dropping it stops the forwarders.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Event>,
    forwarders: Vec<JoinHandle<()>>,
}

impl Subscription {
    /// Next event, or `None` once every relay stream has ended
    pub async fn next_event(&mut self) -> Option<Event> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        for forwarder in &self.forwarders {
            forwarder.abort();
        }
    }
}
