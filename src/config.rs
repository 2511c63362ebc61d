//! Event bus configuration
//!
//! All fields have defaults; a JSON file only needs the fields it overrides.

use crate::error::{EventError, Result};
use crate::topic::DEFAULT_PREFIX;
use crate::watcher::DEFAULT_BUFFER;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// What the watcher does when the dispatcher's inbound channel is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Backpressure {
    /// Wait for room, stalling the watch stream
    #[default]
    Block,
    /// Drop the incoming envelope and keep reading the watch stream
    DropNewest,
}

/// Per-process event bus configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BusConfig {
    /// Topic key prefix (single segment, no `/`)
    pub prefix: String,

    /// TTL of the lease bound to each published record (seconds)
    pub lease_ttl_secs: u64,

    /// Capacity of the watcher → dispatcher channel
    pub watch_buffer: usize,

    pub backpressure: Backpressure,

    /// Upper bound on connection writes in flight at once
    pub max_inflight_writes: usize,

    /// Outbound queue depth of each gateway connection
    pub outbound_buffer: usize,

    /// Deregister a connection as soon as a write to it fails
    pub evict_on_write_failure: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            lease_ttl_secs: 60,
            watch_buffer: DEFAULT_BUFFER,
            backpressure: Backpressure::Block,
            max_inflight_writes: 1024,
            outbound_buffer: 64,
            evict_on_write_failure: false,
        }
    }
}

impl BusConfig {
    /// Load from a JSON file and validate
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            EventError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let config: BusConfig = serde_json::from_str(&json).map_err(|e| {
            EventError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() || self.prefix.contains('/') {
            return Err(EventError::Config(format!(
                "prefix must be a non-empty single segment, got '{}'",
                self.prefix
            )));
        }
        if self.lease_ttl_secs == 0 {
            return Err(EventError::Config("leaseTtlSecs must be > 0".to_string()));
        }
        if self.watch_buffer == 0 {
            return Err(EventError::Config("watchBuffer must be > 0".to_string()));
        }
        if self.max_inflight_writes == 0 {
            return Err(EventError::Config("maxInflightWrites must be > 0".to_string()));
        }
        if self.outbound_buffer == 0 {
            return Err(EventError::Config("outboundBuffer must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}
