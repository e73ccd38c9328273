//! Exchange, queue and binding declarations for feed updates.

use tracing::info;

use crate::config::BrokerSettings;

use super::transport::{BrokerChannel, QueueError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes to queues bound under exactly the message's routing key.
    Direct,
    /// Routes to every bound queue.
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDeclaration {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Names of the exchange, queue and routing key carrying feed updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedTopology {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl FeedTopology {
    pub fn new(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }

    pub fn exchange_declaration(&self) -> ExchangeDeclaration {
        ExchangeDeclaration {
            name: self.exchange.clone(),
            kind: ExchangeKind::Direct,
            durable: true,
            auto_delete: false,
        }
    }

    pub fn queue_declaration(&self) -> QueueDeclaration {
        QueueDeclaration {
            name: self.queue.clone(),
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    pub fn binding(&self) -> QueueBinding {
        QueueBinding {
            queue: self.queue.clone(),
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
        }
    }

    /// Declare the exchange, the queue and the binding between them.
    ///
    /// Safe to repeat. A conflicting existing declaration surfaces as
    /// [`QueueError::TopologyConflict`] and must not be retried.
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> Result<(), QueueError> {
        channel.declare_exchange(&self.exchange_declaration()).await?;
        channel.declare_queue(&self.queue_declaration()).await?;
        channel.bind_queue(&self.binding()).await?;

        info!(
            exchange = %self.exchange,
            queue = %self.queue,
            routing_key = %self.routing_key,
            "Feed topology declared"
        );
        Ok(())
    }
}

impl From<&BrokerSettings> for FeedTopology {
    fn from(settings: &BrokerSettings) -> Self {
        Self::new(
            settings.exchange.clone(),
            settings.queue.clone(),
            settings.routing_key.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declarations_are_durable_direct_and_shared() {
        let topology = FeedTopology::new("feed", "feed-updates", "post.created");

        let exchange = topology.exchange_declaration();
        assert_eq!(exchange.kind, ExchangeKind::Direct);
        assert!(exchange.durable);
        assert!(!exchange.auto_delete);

        let queue = topology.queue_declaration();
        assert!(queue.durable);
        assert!(!queue.exclusive);
        assert!(!queue.auto_delete);

        let binding = topology.binding();
        assert_eq!(binding.queue, "feed-updates");
        assert_eq!(binding.exchange, "feed");
        assert_eq!(binding.routing_key, "post.created");
    }
}
