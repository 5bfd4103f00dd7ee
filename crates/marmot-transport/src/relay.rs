//! The relay seam
//!
//! A [`Relay`] is one connection to one relay. [`NostrRelay`] speaks the Nostr
//! websocket protocol through `nostr-sdk`; tests use [`crate::MemoryRelay`].

use std::time::Duration;

use async_trait::async_trait;
use nostr::{Event, Filter};
use nostr_sdk::prelude::{Client, RelayPoolNotification};
use tokio::sync::{broadcast, mpsc};

use crate::error::RelayError;

/// One relay connection
#[async_trait]
pub trait Relay: Send + Sync + 'static {
    /// Relay url, for logs and errors
    fn url(&self) -> &str;

    /// Publish an event, returning once the relay acknowledged it
    async fn publish(&self, event: &Event) -> Result<(), RelayError>;

    /// Stream stored events matching `filter`, then live ones, until the
    /// receiver is dropped or the connection closes.
    async fn subscribe(&self, filter: Filter) -> Result<mpsc::UnboundedReceiver<Event>, RelayError>;

    /// Stored events matching `filter`, collected for at most `timeout`
    async fn fetch(&self, filter: Filter, timeout: Duration) -> Result<Vec<Event>, RelayError>;
}

/// A relay reached over websocket
#[derive(Debug, Clone)]
pub struct NostrRelay {
    url: String,
    client: Client,
}

impl NostrRelay {
    /// Connect to `url`. Connection happens in the background; operations
    /// before it completes fail and are retried by the transport.
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        let client = Client::default();
        client
            .add_relay(url)
            .await
            .map_err(|e| RelayError::Unreachable {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        client.connect().await;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }

    /// Disconnect
    pub async fn shutdown(&self) {
        self.client.shutdown().await;
    }
}

#[async_trait]
impl Relay for NostrRelay {
    fn url(&self) -> &str {
        &self.url
    }

    async fn publish(&self, event: &Event) -> Result<(), RelayError> {
        let output = self
            .client
            .send_event(event)
            .await
            .map_err(|e| RelayError::Unreachable {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;
        if output.success.is_empty() {
            let reason = output.failed.values().cloned().collect::<Vec<_>>().join(", ");
            return Err(RelayError::Rejected {
                url: self.url.clone(),
                reason,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, filter: Filter) -> Result<mpsc::UnboundedReceiver<Event>, RelayError> {
        let mut notifications = self.client.notifications();
        let output = self
            .client
            .subscribe(filter, None)
            .await
            .map_err(|e| RelayError::Unreachable {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;
        let subscription_id = output.val;

        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(RelayPoolNotification::Event {
                        subscription_id: id,
                        event,
                        ..
                    }) if id == subscription_id => {
                        if tx.send(*event).is_err() {
                            break;
                        }
                    }
                    Ok(RelayPoolNotification::Shutdown) => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(target: "marmot_transport::relay", %url, skipped, "Notification stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            client.unsubscribe(&subscription_id).await;
        });
        Ok(rx)
    }

    async fn fetch(&self, filter: Filter, timeout: Duration) -> Result<Vec<Event>, RelayError> {
        let events = self
            .client
            .fetch_events(filter, timeout)
            .await
            .map_err(|e| RelayError::Unreachable {
                url: self.url.clone(),
                reason: e.to_string(),
            })?;
        Ok(events.into_iter().collect())
    }
}
