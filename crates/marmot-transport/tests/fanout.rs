//! Publish and subscribe across several in-memory relays

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use marmot_transport::{Error, MemoryRelay, Relay, RelayError, Transport, TransportConfig};
use nostr::{Event, EventBuilder, Filter, Keys, Kind};

fn note(content: &str) -> Event {
    EventBuilder::new(Kind::TextNote, content)
        .sign_with_keys(&Keys::generate())
        .unwrap()
}

fn fast_config() -> TransportConfig {
    TransportConfig {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
        publish_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

fn transport(relays: &[MemoryRelay]) -> Transport {
    let relays: Vec<Arc<dyn Relay>> = relays
        .iter()
        .map(|r| Arc::new(r.clone()) as Arc<dyn Relay>)
        .collect();
    Transport::new(relays, fast_config())
}

async fn next(sub: &mut marmot_transport::Subscription) -> Option<Event> {
    tokio::time::timeout(Duration::from_millis(100), sub.next())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
async fn test_one_relay_is_enough() {
    let a = MemoryRelay::new("memory://a");
    let b = MemoryRelay::new("memory://b");
    b.set_offline(true);

    let url = transport(&[a.clone(), b.clone()])
        .publish(&note("hello"))
        .await
        .unwrap();
    assert_eq!(url, "memory://a");
    assert_eq!(a.events().len(), 1);
}

#[tokio::test]
async fn test_all_relays_down() {
    let a = MemoryRelay::new("memory://a");
    let b = MemoryRelay::new("memory://b");
    a.set_offline(true);
    b.set_offline(true);

    let err = transport(&[a.clone(), b.clone()])
        .publish(&note("lost"))
        .await
        .unwrap_err();
    let Error::DeliveryFailed(failures) = err else {
        panic!("expected DeliveryFailed");
    };
    assert_eq!(failures.len(), 2);
    assert_eq!(a.publish_attempts(), 3);
    assert_eq!(b.publish_attempts(), 3);
}

#[tokio::test]
async fn test_failed_publish_does_not_hide_the_event() {
    let a = MemoryRelay::new("memory://a");
    a.set_offline(true);
    let client = transport(&[a.clone()]);
    let event = note("retry me");
    assert!(client.publish(&event).await.is_err());

    // the same event reaches the relay some other way
    a.set_offline(false);
    a.publish(&event).await.unwrap();

    let mut sub = client.subscribe(Filter::new().kind(Kind::TextNote)).await.unwrap();
    assert_eq!(next(&mut sub).await.unwrap().id, event.id);
}

#[tokio::test]
async fn test_own_published_event_is_not_echoed() {
    let a = MemoryRelay::new("memory://a");
    let client = transport(&[a.clone()]);
    let event = note("mine");
    client.publish(&event).await.unwrap();

    let mut sub = client.subscribe(Filter::new().kind(Kind::TextNote)).await.unwrap();
    assert!(next(&mut sub).await.is_none());
}

#[tokio::test]
async fn test_rejection_is_not_retried() {
    let a = MemoryRelay::new("memory://a");
    a.reject_kind(Kind::TextNote);

    let err = transport(&[a.clone()]).publish(&note("no")).await.unwrap_err();
    assert!(matches!(
        err,
        Error::DeliveryFailed(ref f) if matches!(f[0], RelayError::Rejected { .. })
    ));
    assert_eq!(a.publish_attempts(), 1);
}

#[tokio::test]
async fn test_no_relays() {
    let transport = Transport::new(Vec::new(), fast_config());
    assert_eq!(transport.publish(&note("x")).await, Err(Error::NoRelays));
}

#[tokio::test]
async fn test_same_event_from_two_relays_delivered_once() {
    let a = MemoryRelay::new("memory://a");
    let b = MemoryRelay::new("memory://b");
    let event = note("twice");
    a.publish(&event).await.unwrap();
    b.publish(&event).await.unwrap();

    let reader = transport(&[a, b]);
    let mut sub = reader.subscribe(Filter::new().kind(Kind::TextNote)).await.unwrap();
    assert_eq!(next(&mut sub).await.unwrap().id, event.id);
    assert!(next(&mut sub).await.is_none());
}

#[tokio::test]
async fn test_live_events_after_subscribe() {
    let a = MemoryRelay::new("memory://a");
    let reader = transport(&[a.clone()]);
    let writer = transport(&[a]);
    let mut sub = reader.subscribe(Filter::new().kind(Kind::TextNote)).await.unwrap();

    let event = note("live");
    writer.publish(&event).await.unwrap();
    assert_eq!(next(&mut sub).await.unwrap().id, event.id);
}

#[tokio::test]
async fn test_resubscribe_skips_delivered() {
    let a = MemoryRelay::new("memory://a");
    let old = note("old");
    a.publish(&old).await.unwrap();

    let reader = transport(&[a.clone()]);
    let mut first = reader.subscribe(Filter::new().kind(Kind::TextNote)).await.unwrap();
    assert_eq!(next(&mut first).await.unwrap().id, old.id);
    drop(first);

    let new = note("new");
    a.publish(&new).await.unwrap();
    let mut second = reader.subscribe(Filter::new().kind(Kind::TextNote)).await.unwrap();
    assert_eq!(next(&mut second).await.unwrap().id, new.id);
    assert!(next(&mut second).await.is_none());
}

#[tokio::test]
async fn test_subscribe_survives_one_offline_relay() {
    let a = MemoryRelay::new("memory://a");
    let b = MemoryRelay::new("memory://b");
    b.set_offline(true);
    assert!(transport(&[a.clone(), b.clone()])
        .subscribe(Filter::new())
        .await
        .is_ok());

    a.set_offline(true);
    assert!(matches!(
        transport(&[a, b]).subscribe(Filter::new()).await,
        Err(Error::SubscribeFailed(_))
    ));
}

#[tokio::test]
async fn test_fetch_merges_relays_and_ignores_dedup_window() {
    let a = MemoryRelay::new("memory://a");
    let b = MemoryRelay::new("memory://b");
    let shared = note("on both");
    let only_b = note("only on b");
    a.publish(&shared).await.unwrap();
    b.publish(&shared).await.unwrap();
    b.publish(&only_b).await.unwrap();

    let transport = transport(&[a, b]);
    let mut sub = transport
        .subscribe(Filter::new().kind(Kind::TextNote))
        .await
        .unwrap();
    assert!(next(&mut sub).await.is_some());
    assert!(next(&mut sub).await.is_some());

    let fetched = transport
        .fetch(Filter::new().kind(Kind::TextNote))
        .await
        .unwrap();
    let mut ids: Vec<_> = fetched.iter().map(|e| e.id).collect();
    ids.sort();
    let mut expected = vec![shared.id, only_b.id];
    expected.sort();
    assert_eq!(ids, expected);
}

#[tokio::test]
async fn test_fetch_fails_only_when_every_relay_fails() {
    let a = MemoryRelay::new("memory://a");
    let b = MemoryRelay::new("memory://b");
    a.publish(&note("kept")).await.unwrap();
    b.set_offline(true);

    let transport = transport(&[a.clone(), b]);
    assert_eq!(
        transport
            .fetch(Filter::new().kind(Kind::TextNote))
            .await
            .unwrap()
            .len(),
        1
    );

    a.set_offline(true);
    assert!(matches!(
        transport.fetch(Filter::new().kind(Kind::TextNote)).await,
        Err(Error::FetchFailed(failures)) if failures.len() == 2
    ));
}
