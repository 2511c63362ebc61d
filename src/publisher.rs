//! Publisher: writes events into the shared store under a short lease
//!
//! Publishing means "visible to every watcher for up to the lease TTL",
//! not "delivered". There is no delivery acknowledgement.

use crate::error::{EventError, Result};
use crate::provider::KvStore;
use crate::topic::{is_valid_user_id, TopicCodec};
use crate::types::{Event, EventKind, Resource};
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Process-local, monotonically increasing event id source.
///
/// Ids only keep topic keys distinct; they are not unique across processes.
#[derive(Debug)]
pub struct EventIdGenerator {
    next: AtomicU64,
}

impl EventIdGenerator {
    /// Start counting at `start` (zero is skipped; it marks malformed keys)
    pub fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start.max(1)),
        }
    }

    /// Start at the current Unix time in microseconds, so restarted or
    /// parallel processes rarely reuse the same ids
    pub fn time_seeded() -> Self {
        let micros = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        Self::starting_at(micros)
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for EventIdGenerator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

/// Result of a successful publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    pub key: String,
    pub event_id: u64,
    /// Store revision of the write
    pub revision: u64,
}

/// Publishes events for users. Cheap to clone; safe to share.
#[derive(Clone)]
pub struct Publisher {
    store: Arc<dyn KvStore>,
    codec: TopicCodec,
    ids: Arc<EventIdGenerator>,
    ttl: Duration,
}

impl Publisher {
    pub fn new(store: Arc<dyn KvStore>, codec: TopicCodec, ttl: Duration) -> Self {
        Self {
            store,
            codec,
            ids: Arc::new(EventIdGenerator::time_seeded()),
            ttl,
        }
    }

    /// Replace the id generator
    pub fn with_ids(mut self, ids: EventIdGenerator) -> Self {
        self.ids = Arc::new(ids);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Publish a `kind` change of `resource` to every connection of `user_id`
    pub async fn publish(
        &self,
        user_id: &str,
        kind: EventKind,
        resource: Resource,
    ) -> Result<Published> {
        if !is_valid_user_id(user_id) {
            return Err(EventError::InvalidUser(user_id.to_string()));
        }

        let event = Event::new(kind, resource);
        let payload = Bytes::from(event.to_vec()?);
        let event_id = self.ids.next_id();
        let key = self.codec.format(user_id, event_id);

        let lease = self.store.grant(self.ttl).await?;
        let revision = self.store.put(&key, payload, lease).await?;

        tracing::debug!(
            user = user_id,
            key = %key,
            kind = %kind,
            rtype = %event.resource.resource_type,
            rid = %event.resource.resource_id,
            revision,
            "Event published"
        );

        Ok(Published {
            key,
            event_id,
            revision,
        })
    }

    /// Like [`publish`](Self::publish), aborting the store calls when `cancel` fires
    pub async fn publish_until(
        &self,
        cancel: &CancellationToken,
        user_id: &str,
        kind: EventKind,
        resource: Resource,
    ) -> Result<Published> {
        tokio::select! {
            _ = cancel.cancelled() => Err(EventError::Cancelled(format!("publish for user '{}'", user_id))),
            result = self.publish(user_id, kind, resource) => result,
        }
    }
}
