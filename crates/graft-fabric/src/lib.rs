//! Message fabric for graft: topic-routed queues with at-least-once
//! delivery and dead-lettering.
//!
//! The fabric carries only non-authoritative messages; the task store is
//! the source of truth, and consumers deduplicate via the idempotency keys
//! in the envelopes (`task_id`, `dispatch_seq`) and the store's
//! conditional transitions. The shipped backend is Postgres
//! ([`pg::PgFabric`]); the [`Fabric`] trait keeps the broker swappable for
//! any at-least-once broker with topic routing.

pub mod envelope;
pub mod pg;
pub mod routing;

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by fabric operations.
#[derive(Debug, Error)]
pub enum FabricError {
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    #[error("malformed envelope: {0}")]
    Envelope(#[from] serde_json::Error),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// A message handed to a consumer. Must be [`Fabric::ack`]ed after
/// processing or it becomes visible again once its lease lapses.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: i64,
    pub queue: String,
    pub routing_key: String,
    pub payload: serde_json::Value,
    /// How many times this message has been handed out, this delivery
    /// included.
    pub delivery_count: i32,
}

impl Delivery {
    /// `true` when this message has been delivered before.
    pub fn redelivered(&self) -> bool {
        self.delivery_count > 1
    }
}

/// Topic-routed, at-least-once message channels.
#[async_trait]
pub trait Fabric: Send + Sync {
    /// Declare a durable queue and bind it to the given topic patterns.
    /// Idempotent.
    async fn declare_queue(&self, queue: &str, bindings: &[String]) -> Result<(), FabricError>;

    /// Publish a payload under a routing key. The message lands on every
    /// queue with a matching binding.
    async fn publish(
        &self,
        routing_key: &str,
        payload: &serde_json::Value,
    ) -> Result<(), FabricError>;

    /// Take the next visible message from a queue, or `None` when the
    /// queue is empty. The message becomes invisible for the configured
    /// lease; messages past the dead-letter threshold are moved aside
    /// instead of delivered.
    async fn consume(&self, queue: &str) -> Result<Option<Delivery>, FabricError>;

    /// Remove a processed message permanently.
    async fn ack(&self, delivery: &Delivery) -> Result<(), FabricError>;

    /// Return a message to the queue for immediate redelivery.
    async fn nack(&self, delivery: &Delivery) -> Result<(), FabricError>;
}
