//! Store provider trait: the distributed key-value capability the bus needs
//!
//! The bus only needs three operations from the shared store: grant a
//! lease, put a key bound to a lease, and watch a key prefix. All
//! backends (NATS key-value, in-memory, etc.) implement `KvStore`.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::time::Duration;

pub mod memory;
pub mod nats;

/// Store-assigned lease handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LeaseId(pub u64);

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

/// Kind of change observed by a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Put,
    Delete,
}

/// One change notification from a watch
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub key: String,
    pub value: Bytes,
    pub kind: ChangeKind,
    /// Store revision of the change (0 when the backend has none)
    pub revision: u64,
}

impl WatchEvent {
    pub fn put(key: impl Into<String>, value: impl Into<Bytes>, revision: u64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            kind: ChangeKind::Put,
            revision,
        }
    }

    pub fn delete(key: impl Into<String>, revision: u64) -> Self {
        Self {
            key: key.into(),
            value: Bytes::new(),
            kind: ChangeKind::Delete,
            revision,
        }
    }
}

/// Stream of watch notifications. Ends only if the subscription breaks.
pub type WatchStream = BoxStream<'static, Result<WatchEvent>>;

/// Core trait for store backends
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Grant a lease that expires after `ttl`
    async fn grant(&self, ttl: Duration) -> Result<LeaseId>;

    /// Write `value` under `key`, bound to `lease`. Returns the store revision.
    async fn put(&self, key: &str, value: Bytes, lease: LeaseId) -> Result<u64>;

    /// Watch every key starting with `prefix`.
    ///
    /// The stream first replays the live records under the prefix, then
    /// yields changes as they are committed.
    async fn watch(&self, prefix: &str) -> Result<WatchStream>;

    /// Provider name (e.g., "nats", "memory")
    fn name(&self) -> &str;
}
