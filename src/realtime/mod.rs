//! Live connections and the pool that pushes feed updates to them.

pub mod client;
pub mod envelope;
pub mod pool;

pub use client::{Client, ClientSession, CloseReason, ConnectionId};
pub use envelope::Envelope;
pub use pool::{ConnectionPool, InboundMessage, PoolClosed, PoolHandle};
