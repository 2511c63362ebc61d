//! Per-process event bus: publisher, watcher and dispatcher wired together
//!
//! Every process runs one `EventBus` against the shared store. Events
//! published from any process reach the connections registered in every
//! process, because each one watches the whole topic prefix.

use crate::config::BusConfig;
use crate::dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle};
use crate::error::{EventError, Result};
use crate::gateway::{Authenticator, GatewayState};
use crate::provider::KvStore;
use crate::publisher::Publisher;
use crate::registry::RegistryStats;
use crate::topic::TopicCodec;
use crate::watcher::Watcher;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running event bus
pub struct EventBus {
    store: Arc<dyn KvStore>,
    config: BusConfig,
    publisher: Publisher,
    dispatcher: DispatcherHandle,
    cancel: CancellationToken,
    dispatcher_task: JoinHandle<()>,
    watcher_task: JoinHandle<Result<()>>,
}

impl EventBus {
    /// Validate `config`, spawn the dispatcher and start watching the store
    pub async fn start(store: Arc<dyn KvStore>, config: BusConfig) -> Result<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let codec = TopicCodec::new(config.prefix.clone());

        let (dispatcher, dispatcher_task) = Dispatcher::spawn(
            DispatcherConfig {
                inbound_buffer: config.watch_buffer,
                connection_buffer: config.outbound_buffer,
                max_inflight_writes: config.max_inflight_writes,
                evict_on_write_failure: config.evict_on_write_failure,
            },
            cancel.child_token(),
        );

        let watcher = Watcher::new(store.clone(), codec.clone()).with_backpressure(config.backpressure);
        let watcher_task = match watcher
            .start(dispatcher.deliver_sender(), cancel.child_token())
            .await
        {
            Ok(task) => task,
            Err(e) => {
                cancel.cancel();
                let _ = dispatcher_task.await;
                return Err(e);
            }
        };

        let publisher = Publisher::new(store.clone(), codec, config.lease_ttl());

        tracing::info!(
            store = store.name(),
            prefix = %config.prefix,
            lease_ttl_secs = config.lease_ttl_secs,
            "Event bus started"
        );

        Ok(Self {
            store,
            config,
            publisher,
            dispatcher,
            cancel,
            dispatcher_task,
            watcher_task,
        })
    }

    /// Publisher writing under this bus's prefix and lease TTL
    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    pub fn dispatcher(&self) -> DispatcherHandle {
        self.dispatcher.clone()
    }

    /// Route state for the transport gateway
    pub fn gateway(&self, auth: Arc<dyn Authenticator>) -> GatewayState {
        GatewayState {
            dispatcher: self.dispatcher.clone(),
            auth,
            store: self.store.name().to_string(),
        }
    }

    pub fn store_name(&self) -> &str {
        self.store.name()
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Token cancelled by [`shutdown`](Self::shutdown); children of it
    /// can bound other work to the bus lifetime
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn stats(&self) -> Result<RegistryStats> {
        self.dispatcher.stats().await
    }

    /// Stop the watcher and dispatcher and wait for both.
    ///
    /// Returns the watcher's error if its subscription had already ended.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();

        let watched = self
            .watcher_task
            .await
            .map_err(|e| EventError::Closed(format!("watcher task failed: {}", e)))?;
        self.dispatcher_task
            .await
            .map_err(|e| EventError::Closed(format!("dispatcher task failed: {}", e)))?;

        tracing::info!(store = self.store.name(), "Event bus stopped");
        watched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::QueryUserAuthenticator;
    use crate::provider::memory::MemoryStore;
    use crate::types::{EventKind, Resource};

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let store = MemoryStore::default();
        let bus = EventBus::start(Arc::new(store.clone()), BusConfig::default())
            .await
            .unwrap();

        assert_eq!(bus.store_name(), "memory");
        assert_eq!(bus.stats().await.unwrap(), RegistryStats::default());

        let published = bus
            .publisher()
            .publish("u1", EventKind::Create, Resource::new("job", "j-1"))
            .await
            .unwrap();
        assert!(published.key.starts_with("events/u1/"));
        assert!(store.get(&published.key).is_some());

        let cancel = bus.cancel_token();
        bus.shutdown().await.unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = BusConfig {
            lease_ttl_secs: 0,
            ..Default::default()
        };
        let result = EventBus::start(Arc::new(MemoryStore::default()), config).await;
        assert!(matches!(result, Err(EventError::Config(_))));
    }

    #[tokio::test]
    async fn test_custom_prefix_and_gateway_state() {
        let config = BusConfig {
            prefix: "bus".to_string(),
            ..Default::default()
        };
        let bus = EventBus::start(Arc::new(MemoryStore::default()), config)
            .await
            .unwrap();

        let published = bus
            .publisher()
            .publish("u1", EventKind::Update, Resource::default())
            .await
            .unwrap();
        assert!(published.key.starts_with("bus/u1/"));

        let state = bus.gateway(Arc::new(QueryUserAuthenticator));
        assert_eq!(state.store, "memory");
        assert_eq!(state.dispatcher.stats().await.unwrap().users, 0);

        bus.shutdown().await.unwrap();
    }
}
