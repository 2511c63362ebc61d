//! NATS key-value provider configuration

use serde::{Deserialize, Serialize};

/// Storage backend for the key-value bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// NATS connection and bucket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NatsConfig {
    /// Server URL (e.g., "nats://127.0.0.1:4222")
    pub url: String,

    /// Key-value bucket holding the event records
    pub bucket: String,

    /// Maximum age of a record in the bucket (seconds).
    ///
    /// This is the upper bound for any lease granted by the provider.
    pub max_age_secs: u64,

    pub storage: StorageType,

    pub connect_timeout_secs: u64,

    pub request_timeout_secs: u64,

    /// Optional auth token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            bucket: "clusterbus_events".to_string(),
            max_age_secs: 60,
            storage: StorageType::File,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            token: None,
        }
    }
}
