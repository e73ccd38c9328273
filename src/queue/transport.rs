//! Broker seam used by the producer, the consumer pool and topology setup.
//!
//! The vocabulary is exchange/queue/binding. Adapters map it onto whatever
//! their broker offers: [`super::memory::MemoryBroker`] models it directly,
//! [`super::nats::NatsBroker`] maps it onto JetStream streams and durable
//! consumers.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use super::topology::{ExchangeDeclaration, QueueBinding, QueueDeclaration};

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A message handed to the broker. Brokers store every publishing so it
/// survives a broker restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publishing {
    pub content_type: &'static str,
    pub body: Bytes,
}

impl Publishing {
    pub fn persistent_json(body: impl Into<Bytes>) -> Self {
        Self {
            content_type: CONTENT_TYPE_JSON,
            body: body.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("broker channel is closed")]
    ChannelClosed,
    #[error("publish rejected: {0}")]
    Publish(String),
    #[error("topology conflict on `{entity}`: {reason}")]
    TopologyConflict { entity: String, reason: String },
    #[error("topology declaration failed: {0}")]
    Declare(String),
    #[error("subscription failed: {0}")]
    Subscribe(String),
    #[error("acknowledgement failed: {0}")]
    Acknowledge(String),
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

impl QueueError {
    pub fn conflict(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TopologyConflict {
            entity: entity.into(),
            reason: reason.into(),
        }
    }
}

/// Connection to a broker that hands out independent channels.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a channel owned exclusively by the caller.
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, QueueError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare an exchange; matching redeclaration is a no-op.
    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> Result<(), QueueError>;

    /// Declare a queue; matching redeclaration is a no-op.
    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<(), QueueError>;

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), QueueError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
    ) -> Result<(), QueueError>;

    /// Start consuming `queue` with manual acknowledgement.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn DeliveryStream>, QueueError>;

    /// Close the channel. Later operations fail with [`QueueError::ChannelClosed`].
    async fn close(&self);
}

#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery; `None` once the subscription has ended.
    async fn next(&mut self) -> Option<Result<Delivery, QueueError>>;
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), QueueError>;
    async fn nack(&self, requeue: bool) -> Result<(), QueueError>;
}

/// A message received from a queue, pending acknowledgement.
pub struct Delivery {
    body: Bytes,
    redelivered: bool,
    acker: Box<dyn Acker>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish_non_exhaustive()
    }
}

impl Delivery {
    pub fn new(body: Bytes, redelivered: bool, acker: Box<dyn Acker>) -> Self {
        Self {
            body,
            redelivered,
            acker,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the broker delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub async fn ack(self) -> Result<(), QueueError> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), QueueError> {
        self.acker.nack(requeue).await
    }
}
