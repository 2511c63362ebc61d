//! NATS JetStream key-value client: connect, put, watch

use super::config::{NatsConfig, StorageType};
use super::key::{decode_key, encode_key};
use crate::error::{EventError, Result};
use crate::provider::{WatchEvent, WatchStream};
use async_nats::jetstream;
use async_nats::jetstream::kv;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

/// NATS key-value client
///
/// Manages the connection and the key-value bucket lifecycle.
pub struct NatsClient {
    bucket: kv::Store,

    /// Record lifetime of the bucket as it exists on the server
    max_age: Duration,

    config: Arc<NatsConfig>,
}

impl NatsClient {
    /// Connect to NATS and open (or create) the bucket
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let connect_opts = build_connect_options(&config);

        let client = connect_opts
            .connect(&config.url)
            .await
            .map_err(|e| EventError::Connection(format!("{}: {}", config.url, e)))?;

        tracing::info!(url = %config.url, "Connected to NATS");

        let js = jetstream::new(client);
        let bucket = ensure_bucket(&js, &config).await?;
        let max_age = bucket_max_age(&bucket, &config).await?;

        Ok(Self {
            bucket,
            max_age,
            config: Arc::new(config),
        })
    }

    /// Write a value, returning the bucket revision
    pub async fn put(&self, key: &str, value: Bytes) -> Result<u64> {
        let revision = self
            .bucket
            .put(encode_key(key), value)
            .await
            .map_err(|e| EventError::StoreWrite {
                key: key.to_string(),
                reason: e.to_string(),
            })?;

        tracing::debug!(key, revision, "Record written");
        Ok(revision)
    }

    /// Watch the bucket, keeping entries whose key starts with `prefix`
    pub async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        let watch = self
            .bucket
            .watch_with_history(">")
            .await
            .map_err(|e| EventError::Subscription(format!(
                "Failed to watch bucket '{}': {}",
                self.config.bucket, e
            )))?;

        tracing::info!(bucket = %self.config.bucket, prefix, "Bucket watch created");

        let prefix = encode_key(prefix);
        let stream = watch.filter_map(move |entry| {
            let out = match entry {
                Ok(entry) if entry.key.starts_with(&prefix) => {
                    Some(decode_key(&entry.key).map(|key| match entry.operation {
                        kv::Operation::Put => WatchEvent::put(key, entry.value, entry.revision),
                        kv::Operation::Delete | kv::Operation::Purge => {
                            WatchEvent::delete(key, entry.revision)
                        }
                    }))
                }
                Ok(_) => None,
                Err(e) => Some(Err(EventError::Subscription(e.to_string()))),
            };
            futures::future::ready(out)
        });

        Ok(stream.boxed())
    }

    /// Maximum age of records in the bucket; zero means no expiry
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Get the configuration
    pub fn config(&self) -> &NatsConfig {
        &self.config
    }
}

/// Build NATS connect options from config
fn build_connect_options(config: &NatsConfig) -> async_nats::ConnectOptions {
    let mut opts = async_nats::ConnectOptions::new()
        .connection_timeout(Duration::from_secs(config.connect_timeout_secs))
        .request_timeout(Some(Duration::from_secs(config.request_timeout_secs)));

    if let Some(ref token) = config.token {
        opts = opts.token(token.clone());
    }

    opts
}

/// Open the key-value bucket, creating it on first use
async fn ensure_bucket(js: &jetstream::Context, config: &NatsConfig) -> Result<kv::Store> {
    if let Ok(bucket) = js.get_key_value(&config.bucket).await {
        tracing::info!(bucket = %config.bucket, "Key-value bucket opened");
        return Ok(bucket);
    }

    let storage = match config.storage {
        StorageType::File => jetstream::stream::StorageType::File,
        StorageType::Memory => jetstream::stream::StorageType::Memory,
    };

    let bucket = js
        .create_key_value(kv::Config {
            bucket: config.bucket.clone(),
            history: 1,
            max_age: Duration::from_secs(config.max_age_secs),
            storage,
            ..Default::default()
        })
        .await
        .map_err(|e| EventError::Connection(format!(
            "Failed to create key-value bucket '{}': {}",
            config.bucket, e
        )))?;

    tracing::info!(
        bucket = %config.bucket,
        max_age_secs = config.max_age_secs,
        "Key-value bucket created"
    );

    Ok(bucket)
}

/// Read the bucket's configured max age from the server
async fn bucket_max_age(bucket: &kv::Store, config: &NatsConfig) -> Result<Duration> {
    let status = bucket.status().await.map_err(|e| {
        EventError::Connection(format!(
            "Failed to read status of bucket '{}': {}",
            config.bucket, e
        ))
    })?;
    let max_age = status.max_age();

    if max_age != Duration::from_secs(config.max_age_secs) {
        tracing::warn!(
            bucket = %config.bucket,
            configured_secs = config.max_age_secs,
            actual_secs = max_age.as_secs(),
            "Existing bucket max age differs from configuration; using the bucket's"
        );
    }

    Ok(max_age)
}
