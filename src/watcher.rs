//! Watcher: turns store change notifications into envelopes
//!
//! One watcher runs per process. It watches the topic prefix, decodes
//! every PUT into an [`Envelope`] and feeds the dispatcher. Malformed
//! records are logged and dropped; only the end of the underlying
//! subscription stops the loop.

use crate::config::Backpressure;
use crate::error::{EventError, Result};
use crate::provider::{ChangeKind, KvStore, WatchEvent, WatchStream};
use crate::topic::TopicCodec;
use crate::types::{Envelope, Event};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default capacity of the watcher output channel
pub const DEFAULT_BUFFER: usize = 255;

pub struct Watcher {
    store: Arc<dyn KvStore>,
    codec: TopicCodec,
    backpressure: Backpressure,
}

impl Watcher {
    pub fn new(store: Arc<dyn KvStore>, codec: TopicCodec) -> Self {
        Self {
            store,
            codec,
            backpressure: Backpressure::Block,
        }
    }

    pub fn with_backpressure(mut self, backpressure: Backpressure) -> Self {
        self.backpressure = backpressure;
        self
    }

    /// Subscribe and spawn the watch loop with its own bounded output channel
    pub async fn spawn(
        self,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Result<(mpsc::Receiver<Envelope>, JoinHandle<Result<()>>)> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = self.start(tx, cancel).await?;
        Ok((rx, handle))
    }

    /// Subscribe and spawn the watch loop sending into `tx`.
    ///
    /// Subscription errors are returned here; the task resolves to
    /// `Err(Subscription)` if the stream later ends, `Ok(())` on
    /// cancellation or when the receiving side is gone.
    pub async fn start(
        self,
        tx: mpsc::Sender<Envelope>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<Result<()>>> {
        let prefix = self.codec.watch_prefix();
        let stream = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(EventError::Cancelled(format!("watch on '{}'", prefix)));
            }
            stream = self.store.watch(&prefix) => stream?,
        };

        tracing::info!(prefix = %prefix, store = self.store.name(), "Watcher started");

        Ok(tokio::spawn(self.run(stream, tx, cancel)))
    }

    async fn run(
        self,
        mut stream: WatchStream,
        tx: mpsc::Sender<Envelope>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            };

            let change = match next {
                Some(Ok(change)) => change,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Watch notification error");
                    continue;
                }
                None => {
                    tracing::error!(prefix = %self.codec.prefix(), "Watch stream ended");
                    return Err(EventError::Subscription(format!(
                        "watch on '{}' ended",
                        self.codec.watch_prefix()
                    )));
                }
            };

            if change.kind != ChangeKind::Put {
                continue;
            }

            let envelope = match decode(&self.codec, &change) {
                Ok(envelope) => envelope,
                Err(e) => {
                    tracing::warn!(key = %change.key, error = %e, "Dropping malformed record");
                    continue;
                }
            };

            match self.backpressure {
                Backpressure::Block => {
                    let sent = tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = tx.send(envelope) => sent,
                    };
                    if sent.is_err() {
                        tracing::info!("Envelope receiver dropped, watcher stopping");
                        break;
                    }
                }
                Backpressure::DropNewest => match tx.try_send(envelope) {
                    Ok(()) => {}
                    Err(TrySendError::Full(dropped)) => {
                        tracing::warn!(user = %dropped.user_id, key = %change.key, "Watch buffer full, event dropped");
                    }
                    Err(TrySendError::Closed(_)) => {
                        tracing::info!("Envelope receiver dropped, watcher stopping");
                        break;
                    }
                },
            }
        }

        tracing::info!(prefix = %self.codec.prefix(), "Watcher stopped");
        Ok(())
    }
}

/// Decode one PUT notification into an envelope
pub fn decode(codec: &TopicCodec, change: &WatchEvent) -> Result<Envelope> {
    if !codec.owns(&change.key) {
        return Err(EventError::Decode {
            key: change.key.clone(),
            reason: format!("outside prefix '{}'", codec.prefix()),
        });
    }

    let (user_id, _event_id) = codec.parse(&change.key);
    if user_id.is_empty() {
        return Err(EventError::Decode {
            key: change.key.clone(),
            reason: "missing user id".to_string(),
        });
    }

    let event = Event::from_slice(&change.value).map_err(|e| EventError::Decode {
        key: change.key.clone(),
        reason: e.to_string(),
    })?;

    Ok(Envelope::new(user_id, event))
}
