//! In-memory store provider
//!
//! Single-process `KvStore` with real lease expiry on the tokio clock.
//! Expired records are purged lazily whenever the store is touched and
//! are never replayed to new watchers. Useful for tests, benches and
//! single-node deployments.

use super::{ChangeKind, KvStore, LeaseId, WatchEvent, WatchStream};
use crate::error::{EventError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// Memory provider configuration
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Capacity of the change feed shared by all watchers
    pub channel_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 10_000,
        }
    }
}

struct Record {
    value: Bytes,
    lease: LeaseId,
    revision: u64,
}

struct Lease {
    deadline: Instant,
    /// Keys written under this lease; some may since be rebound to another
    keys: Vec<String>,
}

#[derive(Default)]
struct State {
    records: BTreeMap<String, Record>,
    leases: HashMap<LeaseId, Lease>,
    /// Live leases ordered by deadline
    deadlines: BTreeSet<(Instant, LeaseId)>,
    revision: u64,
    next_lease: u64,
}

/// In-memory key-value store with leases and prefix watches
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    changes: broadcast::Sender<WatchEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl MemoryStore {
    pub fn new(config: MemoryConfig) -> Self {
        let (changes, _) = broadcast::channel(config.channel_capacity.max(1));
        Self {
            state: Arc::new(Mutex::new(State::default())),
            changes,
        }
    }

    /// Current value of a key, if it exists and its lease is live
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let mut state = self.lock();
        self.purge_expired(&mut state);
        state.records.get(key).map(|r| r.value.clone())
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        let mut state = self.lock();
        self.purge_expired(&mut state);
        state.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Revoke a lease, deleting every key bound to it
    pub fn revoke(&self, lease: LeaseId) {
        let mut state = self.lock();
        self.drop_lease(&mut state, lease);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn purge_expired(&self, state: &mut State) {
        let now = Instant::now();
        while state
            .deadlines
            .first()
            .is_some_and(|(deadline, _)| *deadline <= now)
        {
            let Some((_, lease)) = state.deadlines.pop_first() else {
                break;
            };
            self.drop_lease(state, lease);
            tracing::trace!(lease = %lease, "Lease expired");
        }
    }

    /// Forget a lease and delete the records still bound to it
    fn drop_lease(&self, state: &mut State, lease: LeaseId) {
        let Some(entry) = state.leases.remove(&lease) else {
            return;
        };
        state.deadlines.remove(&(entry.deadline, lease));

        for key in entry.keys {
            if !state.records.get(&key).is_some_and(|r| r.lease == lease) {
                continue;
            }
            state.records.remove(&key);
            state.revision += 1;
            // No receivers is fine
            let _ = self.changes.send(WatchEvent::delete(key, state.revision));
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId> {
        if ttl.is_zero() {
            return Err(EventError::Lease {
                reason: "ttl must be greater than zero".to_string(),
            });
        }

        let mut state = self.lock();
        self.purge_expired(&mut state);
        state.next_lease += 1;
        let lease = LeaseId(state.next_lease);
        let deadline = Instant::now() + ttl;
        state.leases.insert(
            lease,
            Lease {
                deadline,
                keys: Vec::new(),
            },
        );
        state.deadlines.insert((deadline, lease));
        Ok(lease)
    }

    async fn put(&self, key: &str, value: Bytes, lease: LeaseId) -> Result<u64> {
        let mut state = self.lock();
        self.purge_expired(&mut state);

        let Some(entry) = state.leases.get_mut(&lease) else {
            return Err(EventError::StoreWrite {
                key: key.to_string(),
                reason: format!("lease {} not found", lease),
            });
        };
        entry.keys.push(key.to_string());

        state.revision += 1;
        let revision = state.revision;
        state.records.insert(
            key.to_string(),
            Record {
                value: value.clone(),
                lease,
                revision,
            },
        );
        let _ = self.changes.send(WatchEvent::put(key, value, revision));

        Ok(revision)
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        // Snapshot and subscribe under the same lock so no change falls
        // between the replay and the live feed.
        let (replay, live) = {
            let mut state = self.lock();
            self.purge_expired(&mut state);
            let replay: Vec<Result<WatchEvent>> = state
                .records
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, r)| Ok(WatchEvent::put(k.clone(), r.value.clone(), r.revision)))
                .collect();
            (replay, self.changes.subscribe())
        };

        let prefix = prefix.to_string();
        let live = BroadcastStream::new(live).filter_map(move |item| {
            let out = match item {
                Ok(change) if change.key.starts_with(&prefix) => Some(Ok(change)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, prefix = %prefix, "Memory watch lagged, changes lost");
                    None
                }
            };
            futures::future::ready(out)
        });

        Ok(futures::stream::iter(replay).chain(live).boxed())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next_put(stream: &mut WatchStream) -> WatchEvent {
        loop {
            let change = tokio::time::timeout(Duration::from_secs(1), stream.next())
                .await
                .expect("watch timed out")
                .expect("watch ended")
                .unwrap();
            if change.kind == ChangeKind::Put {
                return change;
            }
        }
    }

    #[tokio::test]
    async fn test_grant_and_put() {
        let store = MemoryStore::default();
        let lease = store.grant(Duration::from_secs(60)).await.unwrap();
        let rev = store.put("events/u1/1", Bytes::from_static(b"a"), lease).await.unwrap();
        assert_eq!(rev, 1);
        assert_eq!(store.get("events/u1/1").unwrap(), Bytes::from_static(b"a"));
        assert_eq!(store.len(), 1);
        assert_eq!(store.name(), "memory");
    }

    #[tokio::test]
    async fn test_grant_zero_ttl_fails() {
        let store = MemoryStore::default();
        let err = store.grant(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, EventError::Lease { .. }));
    }

    #[tokio::test]
    async fn test_put_unknown_lease_fails() {
        let store = MemoryStore::default();
        let err = store
            .put("events/u1/1", Bytes::from_static(b"a"), LeaseId(99))
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::StoreWrite { .. }));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_removes_records() {
        let store = MemoryStore::default();
        let lease = store.grant(Duration::from_secs(2)).await.unwrap();
        store.put("events/u1/1", Bytes::from_static(b"a"), lease).await.unwrap();

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.get("events/u1/1").is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("events/u1/1").is_none());

        // An expired lease can no longer be written to
        let err = store
            .put("events/u1/2", Bytes::from_static(b"b"), lease)
            .await
            .unwrap_err();
        assert!(matches!(err, EventError::StoreWrite { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebound_key_outlives_its_first_lease() {
        let store = MemoryStore::default();
        let short = store.grant(Duration::from_secs(1)).await.unwrap();
        let long = store.grant(Duration::from_secs(10)).await.unwrap();
        store.put("events/u1/1", Bytes::from_static(b"a"), short).await.unwrap();
        store.put("events/u1/1", Bytes::from_static(b"b"), long).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("events/u1/1").unwrap(), Bytes::from_static(b"b"));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mass_expiry_touches_only_expired_leases() {
        const RECORDS: u64 = 20_000;
        let store = MemoryStore::default();
        for id in 0..RECORDS {
            let lease = store.grant(Duration::from_secs(1)).await.unwrap();
            store
                .put(&format!("events/u1/{id}"), Bytes::from_static(b"x"), lease)
                .await
                .unwrap();
        }
        let keep = store.grant(Duration::from_secs(60)).await.unwrap();
        store.put("events/u2/1", Bytes::from_static(b"y"), keep).await.unwrap();
        assert_eq!(store.len(), RECORDS as usize + 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        let started = std::time::Instant::now();
        assert_eq!(store.len(), 1);
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "purge took {:?}",
            started.elapsed()
        );
        assert!(store.get("events/u2/1").is_some());
    }

    #[tokio::test]
    async fn test_watch_replays_then_streams() {
        let store = MemoryStore::default();
        let lease = store.grant(Duration::from_secs(60)).await.unwrap();
        store.put("events/u1/1", Bytes::from_static(b"old"), lease).await.unwrap();
        store.put("other/u1/1", Bytes::from_static(b"skip"), lease).await.unwrap();

        let mut watch = store.watch("events/").await.unwrap();
        let replayed = next_put(&mut watch).await;
        assert_eq!(replayed.key, "events/u1/1");
        assert_eq!(replayed.value, Bytes::from_static(b"old"));

        store.put("other/u2/2", Bytes::from_static(b"skip"), lease).await.unwrap();
        store.put("events/u2/2", Bytes::from_static(b"new"), lease).await.unwrap();
        let live = next_put(&mut watch).await;
        assert_eq!(live.key, "events/u2/2");
        assert_eq!(live.value, Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn test_revoke_emits_delete() {
        let store = MemoryStore::default();
        let lease = store.grant(Duration::from_secs(60)).await.unwrap();
        let mut watch = store.watch("events/").await.unwrap();
        store.put("events/u1/1", Bytes::from_static(b"a"), lease).await.unwrap();

        store.revoke(lease);
        assert!(store.is_empty());

        let put = watch.next().await.unwrap().unwrap();
        assert_eq!(put.kind, ChangeKind::Put);
        let delete = watch.next().await.unwrap().unwrap();
        assert_eq!(delete.kind, ChangeKind::Delete);
        assert_eq!(delete.key, "events/u1/1");
        assert!(delete.revision > put.revision);
    }
}
