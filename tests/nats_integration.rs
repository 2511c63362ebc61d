//! NATS JetStream integration tests
//!
//! These tests require a running NATS server with JetStream enabled:
//!   nats-server -js
//!
//! Tests are skipped automatically if NATS is not available.

use clusterbus::provider::nats::{NatsConfig, NatsStore, StorageType};
use clusterbus::{
    BusConfig, ChangeKind, Connection, Event, EventBus, EventError, EventKind, EventSink, KvStore,
    Resource,
};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Try to connect to NATS. Returns None if server is unavailable.
async fn try_nats_store(bucket_suffix: &str) -> Option<NatsStore> {
    let config = NatsConfig {
        url: "nats://127.0.0.1:4222".to_string(),
        bucket: format!("TEST_CLUSTERBUS_{}", bucket_suffix),
        storage: StorageType::Memory,
        max_age_secs: 60,
        ..Default::default()
    };

    match NatsStore::connect(config).await {
        Ok(store) => Some(store),
        Err(_) => {
            eprintln!("NATS not available, skipping integration test");
            None
        }
    }
}

/// Connect to NATS, or skip the test
macro_rules! nats_store {
    ($suffix:expr) => {
        match try_nats_store($suffix).await {
            Some(store) => Arc::new(store),
            None => return,
        }
    };
}

struct ChannelSink(mpsc::UnboundedSender<Event>);

#[async_trait::async_trait]
impl EventSink for ChannelSink {
    async fn send(&self, event: &Event) -> clusterbus::Result<()> {
        self.0.send(event.clone()).map_err(|e| EventError::Delivery {
            connection: "test".to_string(),
            reason: e.to_string(),
        })
    }
}

#[tokio::test]
async fn test_nats_grant_respects_bucket_max_age() {
    let store = nats_store!("grant");

    assert!(store.grant(Duration::from_secs(60)).await.is_ok());
    assert!(matches!(
        store.grant(Duration::from_secs(61)).await,
        Err(EventError::Lease { .. })
    ));
    assert!(matches!(
        store.grant(Duration::ZERO).await,
        Err(EventError::Lease { .. })
    ));
}

#[tokio::test]
async fn test_nats_existing_bucket_max_age_bounds_leases() {
    let bucket = format!("TEST_CLUSTERBUS_AGE_{}", uuid::Uuid::new_v4().simple());
    let config = |max_age_secs| NatsConfig {
        url: "nats://127.0.0.1:4222".to_string(),
        bucket: bucket.clone(),
        storage: StorageType::Memory,
        max_age_secs,
        ..Default::default()
    };

    let Ok(creator) = NatsStore::connect(config(60)).await else {
        eprintln!("NATS not available, skipping integration test");
        return;
    };
    assert_eq!(creator.client().max_age(), Duration::from_secs(60));

    // Reopening with a larger configured age keeps the bucket's own
    let reopened = NatsStore::connect(config(120)).await.unwrap();
    assert_eq!(reopened.client().max_age(), Duration::from_secs(60));
    assert!(reopened.grant(Duration::from_secs(60)).await.is_ok());
    assert!(matches!(
        reopened.grant(Duration::from_secs(90)).await,
        Err(EventError::Lease { .. })
    ));
}

#[tokio::test]
async fn test_nats_put_then_watch_replays_and_streams() {
    let store = nats_store!("watch");
    let prefix = format!("run{}", uuid::Uuid::new_v4().simple());
    let lease = store.grant(Duration::from_secs(30)).await.unwrap();

    let first = store
        .put(&format!("{prefix}/u1/1"), "first".into(), lease)
        .await
        .unwrap();
    store.put(&format!("other{prefix}/u1/1"), "ignored".into(), lease).await.unwrap();

    let mut watch = store.watch(&format!("{prefix}/")).await.unwrap();
    let replayed = timeout(Duration::from_secs(5), watch.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(replayed.key, format!("{prefix}/u1/1"));
    assert_eq!(replayed.kind, ChangeKind::Put);
    assert_eq!(replayed.revision, first);

    store.put(&format!("{prefix}/u1/2"), "second".into(), lease).await.unwrap();
    let live = timeout(Duration::from_secs(5), watch.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(live.key, format!("{prefix}/u1/2"));
    assert_eq!(&live.value[..], b"second");
}

#[tokio::test]
async fn test_nats_event_reaches_connection_on_other_bus() {
    let store_a = nats_store!("fanout");
    let store_b = nats_store!("fanout");
    let config = BusConfig {
        prefix: format!("fanout{}", uuid::Uuid::new_v4().simple()),
        ..Default::default()
    };

    let publishing = EventBus::start(store_a, config.clone()).await.unwrap();
    let serving = EventBus::start(store_b, config).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    serving
        .dispatcher()
        .register("u1", Connection::new(Arc::new(ChannelSink(tx))))
        .await
        .unwrap();

    publishing
        .publisher()
        .publish(
            "u1",
            EventKind::Create,
            Resource::new("cluster", "c-1").with_value("status", "provisioning"),
        )
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, EventKind::Create);
    assert_eq!(event.resource.resource_id, "c-1");
    assert_eq!(event.resource.values["status"], "provisioning");

    publishing.shutdown().await.unwrap();
    serving.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_nats_opaque_user_id_is_published_and_watched() {
    let store = nats_store!("opaque");
    let prefix = format!("run{}", uuid::Uuid::new_v4().simple());
    let key = format!("{prefix}/tenant@example.com/1");
    let lease = store.grant(Duration::from_secs(30)).await.unwrap();

    let mut watch = store.watch(&format!("{prefix}/")).await.unwrap();
    store.put(&key, "payload".into(), lease).await.unwrap();

    let change = timeout(Duration::from_secs(5), watch.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(change.key, key);
    assert_eq!(&change.value[..], b"payload");
}
