//! Dispatcher: single-owner actor multiplexing events onto connections
//!
//! The actor task is the only owner of the connection [`Registry`]. Every
//! interaction goes through its channels:
//!
//! ```text
//! register   ─┐
//! deregister ─┼─► Dispatcher (owns Registry) ─► per-connection queue ─► writer task ─► EventSink
//! query      ─┤
//! deliver    ─┘
//! ```
//!
//! Register/deregister resolve once the actor has applied them, so a
//! completed `register` is visible to every later delivery. Deliveries
//! are best-effort: no receivers, a full connection queue or a failed
//! write all drop the event.

use crate::error::{EventError, Result};
use crate::registry::{ConnectionId, Registry, RegistryStats};
use crate::types::{Envelope, Event};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const CONTROL_BUFFER: usize = 1024;

/// Destination for the events of one client connection
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Write one event to the client
    async fn send(&self, event: &Event) -> Result<()>;
}

/// A live client connection
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    sink: Arc<dyn EventSink>,
}

impl Connection {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            id: ConnectionId::new(),
            sink,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).finish()
    }
}

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Capacity of the deliver channel
    pub inbound_buffer: usize,
    /// Queued events per connection before new ones are dropped
    pub connection_buffer: usize,
    /// Writes in flight across all connections
    pub max_inflight_writes: usize,
    /// Deregister a connection on its first failed write
    pub evict_on_write_failure: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            inbound_buffer: crate::watcher::DEFAULT_BUFFER,
            connection_buffer: 64,
            max_inflight_writes: 1024,
            evict_on_write_failure: false,
        }
    }
}

struct Registration {
    user_id: String,
    connection: Connection,
    ack: oneshot::Sender<()>,
}

struct Deregistration {
    user_id: String,
    id: ConnectionId,
    ack: Option<oneshot::Sender<()>>,
}

enum Query {
    Connections {
        user_id: String,
        reply: oneshot::Sender<Option<Vec<ConnectionId>>>,
    },
    Stats {
        reply: oneshot::Sender<RegistryStats>,
    },
}

/// Cloneable handle to a running dispatcher
#[derive(Clone)]
pub struct DispatcherHandle {
    register_tx: mpsc::Sender<Registration>,
    deregister_tx: mpsc::Sender<Deregistration>,
    query_tx: mpsc::Sender<Query>,
    deliver_tx: mpsc::Sender<Envelope>,
}

impl DispatcherHandle {
    /// Add `connection` to the live set of `user_id`
    pub async fn register(&self, user_id: impl Into<String>, connection: Connection) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.register_tx
            .send(Registration {
                user_id: user_id.into(),
                connection,
                ack,
            })
            .await
            .map_err(|_| closed("register"))?;
        done.await.map_err(|_| closed("register"))
    }

    /// Remove a connection from the live set of `user_id`
    pub async fn deregister(&self, user_id: impl Into<String>, id: ConnectionId) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.deregister_tx
            .send(Deregistration {
                user_id: user_id.into(),
                id,
                ack: Some(ack),
            })
            .await
            .map_err(|_| closed("deregister"))?;
        done.await.map_err(|_| closed("deregister"))
    }

    /// Hand an envelope to the dispatcher for delivery
    pub async fn deliver(&self, envelope: Envelope) -> Result<()> {
        self.deliver_tx
            .send(envelope)
            .await
            .map_err(|_| closed("deliver"))
    }

    /// Sender feeding the deliver channel (used by the watcher)
    pub fn deliver_sender(&self) -> mpsc::Sender<Envelope> {
        self.deliver_tx.clone()
    }

    /// Live connections of `user_id`; `None` when the user has no entry
    pub async fn connections(&self, user_id: impl Into<String>) -> Result<Option<Vec<ConnectionId>>> {
        let (reply, answer) = oneshot::channel();
        self.query_tx
            .send(Query::Connections {
                user_id: user_id.into(),
                reply,
            })
            .await
            .map_err(|_| closed("query"))?;
        answer.await.map_err(|_| closed("query"))
    }

    pub async fn stats(&self) -> Result<RegistryStats> {
        let (reply, answer) = oneshot::channel();
        self.query_tx
            .send(Query::Stats { reply })
            .await
            .map_err(|_| closed("query"))?;
        answer.await.map_err(|_| closed("query"))
    }
}

fn closed(op: &str) -> EventError {
    EventError::Closed(format!("{} after dispatcher stopped", op))
}

/// Per-connection state held in the registry
struct Member {
    queue: mpsc::Sender<Arc<Event>>,
}

/// The registry-owning actor
pub struct Dispatcher {
    registry: Registry<Member>,
    config: DispatcherConfig,
    limiter: Arc<Semaphore>,
    evict_tx: mpsc::WeakSender<Deregistration>,
}

impl Dispatcher {
    /// Spawn the actor. It runs until `cancel` fires or every handle and
    /// deliver sender is dropped.
    pub fn spawn(config: DispatcherConfig, cancel: CancellationToken) -> (DispatcherHandle, JoinHandle<()>) {
        let (register_tx, register_rx) = mpsc::channel(CONTROL_BUFFER);
        let (deregister_tx, deregister_rx) = mpsc::channel(CONTROL_BUFFER);
        let (query_tx, query_rx) = mpsc::channel(CONTROL_BUFFER);
        let (deliver_tx, deliver_rx) = mpsc::channel(config.inbound_buffer.max(1));

        let dispatcher = Dispatcher {
            registry: Registry::new(),
            limiter: Arc::new(Semaphore::new(config.max_inflight_writes.max(1))),
            evict_tx: deregister_tx.downgrade(),
            config,
        };

        let join = tokio::spawn(dispatcher.run(register_rx, deregister_rx, query_rx, deliver_rx, cancel));

        let handle = DispatcherHandle {
            register_tx,
            deregister_tx,
            query_tx,
            deliver_tx,
        };
        (handle, join)
    }

    async fn run(
        mut self,
        register_rx: mpsc::Receiver<Registration>,
        deregister_rx: mpsc::Receiver<Deregistration>,
        query_rx: mpsc::Receiver<Query>,
        deliver_rx: mpsc::Receiver<Envelope>,
        cancel: CancellationToken,
    ) {
        tracing::info!("Dispatcher started");

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = self.serve(register_rx, deregister_rx, query_rx, deliver_rx) => {}
        }

        // Dropping the queues ends every writer task
        let remaining = self.registry.drain().len();
        tracing::info!(connections = remaining, "Dispatcher stopped");
    }

    /// Process messages in receipt order until every channel is closed
    async fn serve(
        &mut self,
        mut register_rx: mpsc::Receiver<Registration>,
        mut deregister_rx: mpsc::Receiver<Deregistration>,
        mut query_rx: mpsc::Receiver<Query>,
        mut deliver_rx: mpsc::Receiver<Envelope>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(reg) = register_rx.recv() => {
                    self.register(reg.user_id, reg.connection);
                    let _ = reg.ack.send(());
                }
                Some(dereg) = deregister_rx.recv() => {
                    self.deregister(&dereg.user_id, dereg.id);
                    if let Some(ack) = dereg.ack {
                        let _ = ack.send(());
                    }
                }
                Some(query) = query_rx.recv() => self.answer(query),
                Some(envelope) = deliver_rx.recv() => self.dispatch(envelope),
                else => break,
            }
        }
    }

    fn register(&mut self, user_id: String, connection: Connection) {
        if self.registry.contains(&user_id, connection.id) {
            return;
        }

        let (queue, rx) = mpsc::channel(self.config.connection_buffer.max(1));
        let writer = Writer {
            user_id: user_id.clone(),
            id: connection.id,
            sink: connection.sink,
            limiter: self.limiter.clone(),
            evict_tx: self
                .config
                .evict_on_write_failure
                .then(|| self.evict_tx.clone()),
        };
        tokio::spawn(writer.run(rx));

        self.registry.register(&user_id, connection.id, Member { queue });
        tracing::info!(user = %user_id, connection = %connection.id, "Connection registered");
    }

    fn deregister(&mut self, user_id: &str, id: ConnectionId) {
        if self.registry.deregister(user_id, id).is_some() {
            tracing::info!(user = %user_id, connection = %id, "Connection deregistered");
        }
    }

    fn answer(&self, query: Query) {
        match query {
            Query::Connections { user_id, reply } => {
                let _ = reply.send(self.registry.connection_ids(&user_id));
            }
            Query::Stats { reply } => {
                let _ = reply.send(self.registry.stats());
            }
        }
    }

    fn dispatch(&self, envelope: Envelope) {
        let Some(members) = self.registry.connections(&envelope.user_id) else {
            tracing::debug!(user = %envelope.user_id, "No receivers, event discarded");
            return;
        };

        let event = Arc::new(envelope.event);
        for (id, member) in members {
            match member.queue.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(user = %envelope.user_id, connection = %id, "Connection queue full, event dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(user = %envelope.user_id, connection = %id, "Connection writer gone, event dropped");
                }
            }
        }
    }
}

/// Drains one connection's queue into its sink, in order
struct Writer {
    user_id: String,
    id: ConnectionId,
    sink: Arc<dyn EventSink>,
    limiter: Arc<Semaphore>,
    evict_tx: Option<mpsc::WeakSender<Deregistration>>,
}

impl Writer {
    async fn run(self, mut queue: mpsc::Receiver<Arc<Event>>) {
        while let Some(event) = queue.recv().await {
            let Ok(_permit) = self.limiter.acquire().await else {
                break;
            };

            match self.sink.send(&event).await {
                Ok(()) => {
                    tracing::debug!(user = %self.user_id, connection = %self.id, kind = %event.kind, "Event delivered");
                }
                Err(e) => {
                    tracing::warn!(user = %self.user_id, connection = %self.id, error = %e, "Delivery failed");
                    if self.evict().await {
                        break;
                    }
                }
            }
        }
    }

    /// Ask the dispatcher to drop this connection. Returns true if asked.
    async fn evict(&self) -> bool {
        let Some(tx) = self.evict_tx.as_ref().and_then(|weak| weak.upgrade()) else {
            return false;
        };
        tx.send(Deregistration {
            user_id: self.user_id.clone(),
            id: self.id,
            ack: None,
        })
        .await
        .is_ok()
    }
}
