//! Fanout event bus carrying cache invalidation events.
//!
//! # Topology
//!
//! ```text
//!  ingest ──publish──▶ [blockchain_events: fanout, durable]
//!                          │            │
//!                          ▼            ▼
//!                   queue (serve-a)  queue (serve-b)   durable, one per instance
//!                          │            │
//!                   EventConsumer   EventConsumer      ack after handling,
//!                                                       nack + requeue on failure
//! ```
//!
//! Every reader instance binds its own durable queue, so each one receives
//! every event, including those published while it was disconnected.
//!
//! Two brokers implement the traits here: [`AmqpPublisher`]/[`AmqpSubscriber`]
//! over RabbitMQ, and [`MemoryBroker`] for tests and single-process runs.

mod amqp;
mod consumer;
mod memory;

pub use amqp::{AmqpConfig, AmqpPublisher, AmqpSubscriber, AmqpSubscription, DEFAULT_AMQP_TIMEOUT};
pub use consumer::{ConsumerConfig, DeliveryOutcome, EventConsumer};
pub use memory::{MemoryBroker, MemorySubscriber, MemorySubscription};

use async_trait::async_trait;

use crate::Result;
use crate::event::InvalidationEvent;

/// Publishes invalidation events to every subscriber.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &InvalidationEvent) -> Result<()>;
}

/// A message taken from a queue, awaiting ack or nack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned tag used to ack or nack this delivery.
    pub tag: u64,
    /// Raw message body.
    pub payload: Vec<u8>,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
}

/// An open consumer on one queue.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next delivery. `Ok(None)` means the stream closed.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>>;

    /// Acknowledge a delivery; the broker drops the message.
    async fn ack(&mut self, tag: u64) -> Result<()>;

    /// Reject a delivery. With `requeue` the broker delivers it again.
    async fn nack(&mut self, tag: u64, requeue: bool) -> Result<()>;
}

/// Opens subscriptions, reconnecting to the broker as needed.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self) -> Result<Box<dyn Subscription>>;
}

/// Reacts to one invalidation event.
///
/// Returning an error causes the event to be redelivered, so handlers must be
/// idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &InvalidationEvent) -> Result<()>;
}
