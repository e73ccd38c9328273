//! Publishing side of the feed-update queue.

use bytes::Bytes;
use tracing::{debug, instrument, warn};

use super::message::FeedUpdateMessage;
use super::topology::FeedTopology;
use super::transport::{Broker, BrokerChannel, Publishing, QueueError};

/// Publishes feed updates on a channel it owns.
pub struct FeedProducer {
    channel: Box<dyn BrokerChannel>,
    exchange: String,
    routing_key: String,
}

impl FeedProducer {
    pub async fn connect(broker: &dyn Broker, topology: &FeedTopology) -> Result<Self, QueueError> {
        let channel = broker.open_channel().await?;
        Ok(Self::new(channel, topology))
    }

    pub fn new(channel: Box<dyn BrokerChannel>, topology: &FeedTopology) -> Self {
        Self {
            channel,
            exchange: topology.exchange.clone(),
            routing_key: topology.routing_key.clone(),
        }
    }

    /// Publish one persistent JSON event. Makes a single attempt.
    #[instrument(skip_all, fields(exchange = %self.exchange, bytes = payload.len()))]
    pub async fn publish(&self, payload: Bytes) -> Result<(), QueueError> {
        let publishing = Publishing::persistent_json(payload);

        match self
            .channel
            .publish(&self.exchange, &self.routing_key, publishing)
            .await
        {
            Ok(()) => {
                debug!(routing_key = %self.routing_key, "Feed update published");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "Feed update publish failed");
                Err(err)
            }
        }
    }

    pub async fn publish_message(&self, message: &FeedUpdateMessage) -> Result<(), QueueError> {
        let payload = message.to_bytes()?;
        self.publish(Bytes::from(payload)).await
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }
}
