//! NATS JetStream key-value store provider
//!
//! Implements `KvStore` on a JetStream key-value bucket. The bucket's
//! `max_age` expires records, so leases are tracked locally: a lease is
//! granted when its TTL fits inside the bucket's max age. Keys are
//! escaped into the bucket key alphabet on write and restored on watch.

mod client;
mod config;
mod key;

pub use client::NatsClient;
pub use config::{NatsConfig, StorageType};
pub use key::{decode_key, encode_key};

use crate::error::{EventError, Result};
use crate::provider::{KvStore, LeaseId, WatchStream};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// NATS key-value store provider
pub struct NatsStore {
    client: NatsClient,
    next_lease: AtomicU64,
}

impl NatsStore {
    /// Connect to NATS and open the bucket
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let client = NatsClient::connect(config).await?;
        Ok(Self {
            client,
            next_lease: AtomicU64::new(1),
        })
    }

    /// Get the underlying client for advanced usage
    pub fn client(&self) -> &NatsClient {
        &self.client
    }
}

#[async_trait]
impl KvStore for NatsStore {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId> {
        check_ttl(ttl, self.client.max_age())?;
        Ok(LeaseId(self.next_lease.fetch_add(1, Ordering::Relaxed)))
    }

    async fn put(&self, key: &str, value: Bytes, _lease: LeaseId) -> Result<u64> {
        self.client.put(key, value).await
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        self.client.watch(prefix).await
    }

    fn name(&self) -> &str {
        "nats"
    }
}

/// A lease must expire no later than the bucket would expire the record.
/// A bucket without a max age never expires records, so it grants nothing.
fn check_ttl(ttl: Duration, max_age: Duration) -> Result<()> {
    if ttl.is_zero() {
        return Err(EventError::Lease {
            reason: "ttl must be greater than zero".to_string(),
        });
    }
    if max_age.is_zero() {
        return Err(EventError::Lease {
            reason: "bucket has no max age, records would never expire".to_string(),
        });
    }
    if ttl > max_age {
        return Err(EventError::Lease {
            reason: format!(
                "ttl {}s exceeds bucket max age {}s",
                ttl.as_secs(),
                max_age.as_secs()
            ),
        });
    }
    Ok(())
}
