//! In-process message bus backend
//!
//! Each subscription owns an unbounded FIFO queue and a worker task that
//! drains it into the handler. Publishing enqueues onto every subscriber of
//! the channel in one pass under the registry lock, which preserves
//! per-channel publish order for a single publisher. Handler failures are
//! republished on `system.errors`; the publisher never sees them.

use crate::bus::channels::{self, canonicalize_channel, validate_channel};
use crate::bus::{BusError, EventHandler, MessageBus, SubscriptionToken};
use crate::observability::metrics::metrics;
use crate::protocol::{Event, EventPayload};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct SubEntry {
    channel: String,
    sender: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct Registry {
    subscriptions: HashMap<u64, SubEntry>,
    by_channel: HashMap<String, Vec<u64>>,
}

struct BusInner {
    registry: Mutex<Registry>,
    next_token: AtomicU64,
}

impl BusInner {
    /// Enqueue onto every subscriber of `channel`. No validation; callers
    /// have already canonicalized and validated.
    fn deliver(&self, channel: &str, event: &Event) {
        let registry = self.registry.lock().expect("bus registry poisoned");
        let Some(tokens) = registry.by_channel.get(channel) else {
            debug!(channel = %channel, kind = ?event.kind(), "no subscribers for event");
            return;
        };
        for token in tokens {
            if let Some(entry) = registry.subscriptions.get(token) {
                // A closed receiver means the worker is gone; skip it.
                let _ = entry.sender.send(event.clone());
            }
        }
    }
}

/// The default bus: fully in-process, no external dependency.
pub struct InMemoryBus {
    inner: Arc<BusInner>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry: Mutex::new(Registry::default()),
                next_token: AtomicU64::new(1),
            }),
        }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, channel: &str, event: Event) -> Result<(), BusError> {
        event.validate().map_err(|e| {
            warn!(channel = %channel, error = %e, "rejected malformed event at publish");
            e
        })?;
        let channel = canonicalize_channel(channel);
        validate_channel(&channel)?;

        metrics().record_bus_published();
        self.inner.deliver(&channel, &event);
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionToken, BusError> {
        let channel = canonicalize_channel(channel);
        validate_channel(&channel)?;

        let (sender, mut receiver) = mpsc::unbounded_channel::<Event>();
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);

        {
            let mut registry = self.inner.registry.lock().expect("bus registry poisoned");
            registry.subscriptions.insert(
                token,
                SubEntry {
                    channel: channel.clone(),
                    sender,
                },
            );
            registry.by_channel.entry(channel.clone()).or_default().push(token);
        }

        // Worker: drain the queue into the handler, reporting failures on the
        // error channel. Errors from a system.errors handler are only logged,
        // to avoid feeding the error channel from itself.
        let inner = Arc::downgrade(&self.inner);
        let worker_channel = channel.clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                metrics().record_bus_received();
                if let Err(err) = handler.handle(event.clone()).await {
                    warn!(
                        channel = %worker_channel,
                        error = %err,
                        event_kind = ?event.kind(),
                        "event handler failed"
                    );
                    if worker_channel == channels::SYSTEM_ERRORS {
                        continue;
                    }
                    if let Some(inner) = inner.upgrade() {
                        let report = Event::new(
                            "bus",
                            event.workflow_id.clone(),
                            event.task_id.clone(),
                            EventPayload::HandlerError {
                                channel: worker_channel.clone(),
                                message: err.to_string(),
                            },
                        );
                        inner.deliver(channels::SYSTEM_ERRORS, &report);
                    }
                }
            }
        });

        Ok(SubscriptionToken(token))
    }

    async fn unsubscribe(&self, token: SubscriptionToken) -> Result<(), BusError> {
        let mut registry = self.inner.registry.lock().expect("bus registry poisoned");
        let entry = registry
            .subscriptions
            .remove(&token.0)
            .ok_or(BusError::UnknownSubscription)?;
        if let Some(tokens) = registry.by_channel.get_mut(&entry.channel) {
            tokens.retain(|t| *t != token.0);
        }
        // Dropping the sender lets the worker drain what is queued and exit.
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }
}
