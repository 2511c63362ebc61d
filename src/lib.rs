//! # clusterbus
//!
//! Distributed resource-change event bus with per-process WebSocket fanout.
//!
//! ## Overview
//!
//! Backend services publish create/update/delete events for a user. Each
//! event is written to a shared key-value store under a short lease.
//! Every API process watches the store, so an event published anywhere
//! reaches that user's connections on every process.
//!
//! ## Quick Start
//!
//! ```rust
//! use clusterbus::{BusConfig, EventBus, EventKind, Resource};
//! use clusterbus::provider::memory::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> clusterbus::Result<()> {
//! let bus = EventBus::start(Arc::new(MemoryStore::default()), BusConfig::default()).await?;
//!
//! bus.publisher()
//!     .publish(
//!         "u1",
//!         EventKind::Create,
//!         Resource::new("repo_event", "evt-1").with_value("status", "pending"),
//!     )
//!     .await?;
//!
//! bus.shutdown().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Providers
//!
//! - **memory** - In-process store for tests and single-process use
//! - **nats** - NATS JetStream key-value bucket shared by a fleet
//!
//! ## Architecture
//!
//! - **KvStore** trait - lease, put and prefix watch on the shared store
//! - **Publisher** - writes `<prefix>/<user>/<id>` records under a lease
//! - **Watcher** - decodes observed records into envelopes
//! - **Dispatcher** - single-owner actor mapping users to connections
//! - **gateway** - WebSocket endpoint registering authenticated clients

pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod provider;
pub mod publisher;
pub mod registry;
pub mod topic;
pub mod types;
pub mod watcher;

// Re-export core types
pub use bus::EventBus;
pub use config::{Backpressure, BusConfig};
pub use dispatcher::{Connection, Dispatcher, DispatcherConfig, DispatcherHandle, EventSink};
pub use error::{EventError, Result};
pub use provider::{ChangeKind, KvStore, LeaseId, WatchEvent, WatchStream};
pub use publisher::{EventIdGenerator, Published, Publisher};
pub use registry::{ConnectionId, RegistryStats};
pub use topic::{format_topic, parse_topic, TopicCodec};
pub use types::{Envelope, Event, EventKind, Resource, Values};
pub use watcher::Watcher;

// Re-export providers for convenience
pub use provider::memory::{MemoryConfig, MemoryStore};
pub use provider::nats::{NatsClient, NatsConfig, NatsStore, StorageType};
