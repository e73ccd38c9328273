//! Feed-update queue: topology, producer, consumer pool and broker adapters.
//!
//! ```text
//! PostOrchestrator ──publish──▶ exchange ──routing key──▶ queue ──▶ N workers ──▶ FeedCache
//! ```

pub mod consumer;
pub mod memory;
pub mod message;
pub mod nats;
pub mod producer;
pub mod topology;
pub mod transport;

pub use consumer::{FeedConsumerPool, FeedUpdateHandler, Outcome};
pub use memory::MemoryBroker;
pub use message::FeedUpdateMessage;
pub use nats::NatsBroker;
pub use producer::FeedProducer;
pub use topology::FeedTopology;
pub use transport::{Broker, BrokerChannel, Delivery, QueueError};
