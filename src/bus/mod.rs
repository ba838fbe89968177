//! Message bus: typed pub/sub linking planner, orchestrator, and agents
//!
//! Two interchangeable back-ends satisfy the same [`MessageBus`] trait: an
//! in-process queue ([`memory::InMemoryBus`]) and a broker-backed variant
//! ([`mqtt::MqttBus`]). Delivery is at-least-once within a process, so
//! handlers must be idempotent. Ordering is per-channel FIFO for a single
//! publisher; nothing is guaranteed across channels.

use crate::protocol::{Event, EventValidationError};
use async_trait::async_trait;
use thiserror::Error;

pub mod channels;
pub mod memory;
pub mod mqtt;

pub use memory::InMemoryBus;
pub use mqtt::MqttBus;

/// Opaque handle returned by `subscribe`, used to cancel the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(pub(crate) u64);

/// A subscriber callback. Handlers run on the bus runtime; an error returned
/// here is surfaced on the `system.errors` channel and never propagates back
/// to the publisher.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event) -> Result<(), HandlerError>;
}

/// Failure inside a subscriber, reported but not fatal to the bus.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Typed publish/subscribe facility.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish an event to a channel. The event is validated first; a
    /// malformed event is rejected here and never routed.
    async fn publish(&self, channel: &str, event: Event) -> Result<(), BusError>;

    /// Register a handler for a channel. The handler observes events in
    /// publish order for any single publisher.
    async fn subscribe(
        &self,
        channel: &str,
        handler: std::sync::Arc<dyn EventHandler>,
    ) -> Result<SubscriptionToken, BusError>;

    /// Remove a subscription. Events already queued may still be delivered.
    async fn unsubscribe(&self, token: SubscriptionToken) -> Result<(), BusError>;

    /// Whether the backing transport is currently usable.
    fn is_connected(&self) -> bool;
}

/// Bus-level errors.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("malformed event rejected at publish: {0}")]
    MalformedEvent(#[from] EventValidationError),
    #[error("invalid channel: {0}")]
    InvalidChannel(#[from] channels::ChannelError),
    #[error("unknown subscription token")]
    UnknownSubscription,
    #[error("bus transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("failed to encode event: {0}")]
    Encoding(#[from] serde_json::Error),
}
