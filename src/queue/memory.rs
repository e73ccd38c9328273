//! In-process broker with direct/fanout routing and manual acknowledgement.
//!
//! Used for single-process deployments and tests. Messages live only as long
//! as the broker value; unsettled deliveries go back to the front of their
//! queue when dropped, the way a broker requeues on channel loss.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Notify, watch};
use tracing::debug;

use crate::util::lock::mutex_lock;

use super::topology::{ExchangeDeclaration, ExchangeKind, QueueBinding, QueueDeclaration};
use super::transport::{
    Acker, Broker, BrokerChannel, Delivery, DeliveryStream, Publishing, QueueError,
};

const SOURCE: &str = "queue::memory";

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    topology: Mutex<Topology>,
    unreachable: AtomicBool,
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, ExchangeDeclaration>,
    queues: HashMap<String, Arc<MemoryQueue>>,
    bindings: Vec<QueueBinding>,
}

struct MemoryQueue {
    declaration: QueueDeclaration,
    ready: Mutex<VecDeque<Pending>>,
    available: Notify,
}

struct Pending {
    publishing: Publishing,
    deliveries: u32,
}

impl MemoryQueue {
    fn new(declaration: QueueDeclaration) -> Self {
        Self {
            declaration,
            ready: Mutex::new(VecDeque::new()),
            available: Notify::new(),
        }
    }

    fn enqueue(&self, pending: Pending) {
        mutex_lock(&self.ready, SOURCE, "enqueue").push_back(pending);
        self.available.notify_one();
    }

    fn requeue(&self, pending: Pending) {
        mutex_lock(&self.ready, SOURCE, "requeue").push_front(pending);
        self.available.notify_one();
    }

    fn take(&self) -> Option<Pending> {
        let mut pending = mutex_lock(&self.ready, SOURCE, "take").pop_front()?;
        pending.deliveries += 1;
        Some(pending)
    }

    fn depth(&self) -> usize {
        mutex_lock(&self.ready, SOURCE, "depth").len()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) the broker connection.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Messages waiting in `queue`, oldest first, excluding unsettled deliveries.
    pub fn pending(&self, queue: &str) -> Vec<Publishing> {
        let Some(queue) = self.queue(queue) else {
            return Vec::new();
        };
        mutex_lock(&queue.ready, SOURCE, "pending")
            .iter()
            .map(|pending| pending.publishing.clone())
            .collect()
    }

    pub fn depth(&self, queue: &str) -> usize {
        self.queue(queue).map_or(0, |queue| queue.depth())
    }

    fn queue(&self, name: &str) -> Option<Arc<MemoryQueue>> {
        mutex_lock(&self.state.topology, SOURCE, "queue")
            .queues
            .get(name)
            .cloned()
    }
}

impl BrokerState {
    fn ensure_reachable(&self) -> Result<(), QueueError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(QueueError::Connection("broker unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, QueueError> {
        self.state.ensure_reachable()?;
        let (closed, _) = watch::channel(false);
        Ok(Box::new(MemoryChannel {
            state: self.state.clone(),
            closed,
        }))
    }
}

struct MemoryChannel {
    state: Arc<BrokerState>,
    closed: watch::Sender<bool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if *self.closed.borrow() {
            return Err(QueueError::ChannelClosed);
        }
        self.state.ensure_reachable()
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, exchange: &ExchangeDeclaration) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut topology = mutex_lock(&self.state.topology, SOURCE, "declare_exchange");
        match topology.exchanges.get(&exchange.name) {
            Some(existing) if existing == exchange => Ok(()),
            Some(existing) => Err(QueueError::conflict(
                format!("exchange {}", exchange.name),
                format!(
                    "exists as {} (durable={}, auto_delete={}), requested {} (durable={}, auto_delete={})",
                    existing.kind.as_str(),
                    existing.durable,
                    existing.auto_delete,
                    exchange.kind.as_str(),
                    exchange.durable,
                    exchange.auto_delete,
                ),
            )),
            None => {
                topology
                    .exchanges
                    .insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueDeclaration) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut topology = mutex_lock(&self.state.topology, SOURCE, "declare_queue");
        match topology.queues.get(&queue.name) {
            Some(existing) if existing.declaration == *queue => Ok(()),
            Some(existing) => Err(QueueError::conflict(
                format!("queue {}", queue.name),
                format!(
                    "exists with durable={}, exclusive={}, auto_delete={}",
                    existing.declaration.durable,
                    existing.declaration.exclusive,
                    existing.declaration.auto_delete,
                ),
            )),
            None => {
                topology
                    .queues
                    .insert(queue.name.clone(), Arc::new(MemoryQueue::new(queue.clone())));
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), QueueError> {
        self.ensure_open()?;
        let mut topology = mutex_lock(&self.state.topology, SOURCE, "bind_queue");
        if !topology.exchanges.contains_key(&binding.exchange) {
            return Err(QueueError::Declare(format!(
                "no exchange `{}`",
                binding.exchange
            )));
        }
        if !topology.queues.contains_key(&binding.queue) {
            return Err(QueueError::Declare(format!("no queue `{}`", binding.queue)));
        }
        if !topology.bindings.contains(binding) {
            topology.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        publishing: Publishing,
    ) -> Result<(), QueueError> {
        self.ensure_open()?;
        let targets: Vec<Arc<MemoryQueue>> = {
            let topology = mutex_lock(&self.state.topology, SOURCE, "publish");
            let Some(declared) = topology.exchanges.get(exchange) else {
                return Err(QueueError::Publish(format!("no exchange `{exchange}`")));
            };
            topology
                .bindings
                .iter()
                .filter(|binding| binding.exchange == exchange)
                .filter(|binding| {
                    declared.kind == ExchangeKind::Fanout || binding.routing_key == routing_key
                })
                .filter_map(|binding| topology.queues.get(&binding.queue).cloned())
                .collect()
        };

        if targets.is_empty() {
            debug!(exchange, routing_key, "Message unroutable; dropped");
        }
        for queue in targets {
            queue.enqueue(Pending {
                publishing: publishing.clone(),
                deliveries: 0,
            });
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<Box<dyn DeliveryStream>, QueueError> {
        self.ensure_open()?;
        let Some(target) = mutex_lock(&self.state.topology, SOURCE, "consume")
            .queues
            .get(queue)
            .cloned()
        else {
            return Err(QueueError::Subscribe(format!("no queue `{queue}`")));
        };

        debug!(queue, consumer_tag, "Consumer attached");
        Ok(Box::new(MemoryDeliveries {
            queue: target,
            closed: self.closed.subscribe(),
        }))
    }

    async fn close(&self) {
        self.closed.send_replace(true);
    }
}

struct MemoryDeliveries {
    queue: Arc<MemoryQueue>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveries {
    async fn next(&mut self) -> Option<Result<Delivery, QueueError>> {
        loop {
            if *self.closed.borrow_and_update() {
                return None;
            }

            let available = self.queue.available.notified();
            if let Some(pending) = self.queue.take() {
                let body = pending.publishing.body.clone();
                let redelivered = pending.deliveries > 1;
                let acker = MemoryAcker {
                    queue: self.queue.clone(),
                    pending: Mutex::new(Some(pending)),
                    closed: self.closed.clone(),
                };
                return Some(Ok(Delivery::new(body, redelivered, Box::new(acker))));
            }

            tokio::select! {
                _ = available => {}
                changed = self.closed.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    pending: Mutex<Option<Pending>>,
    closed: watch::Receiver<bool>,
}

impl MemoryAcker {
    fn settle(&self) -> Result<Option<Pending>, QueueError> {
        if *self.closed.borrow() {
            return Err(QueueError::ChannelClosed);
        }
        Ok(mutex_lock(&self.pending, SOURCE, "settle").take())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.settle()?;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), QueueError> {
        if let Some(pending) = self.settle()?
            && requeue
        {
            self.queue.requeue(pending);
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if let Some(pending) = mutex_lock(&self.pending, SOURCE, "drop").take() {
            self.queue.requeue(pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::queue::topology::FeedTopology;

    fn topology() -> FeedTopology {
        FeedTopology::new("feed", "feed-updates", "post.created")
    }

    async fn declared_broker() -> (MemoryBroker, Box<dyn BrokerChannel>) {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.expect("channel");
        topology().declare(channel.as_ref()).await.expect("declare");
        (broker, channel)
    }

    async fn next_delivery(stream: &mut Box<dyn DeliveryStream>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("delivery within timeout")
            .expect("stream open")
            .expect("delivery")
    }

    #[tokio::test]
    async fn redeclaring_same_topology_is_a_no_op() {
        let (broker, channel) = declared_broker().await;
        topology().declare(channel.as_ref()).await.expect("redeclare");

        channel
            .publish("feed", "post.created", Publishing::persistent_json("{}"))
            .await
            .expect("publish");
        assert_eq!(broker.depth("feed-updates"), 1);
    }

    #[tokio::test]
    async fn conflicting_exchange_kind_is_rejected() {
        let (_broker, channel) = declared_broker().await;
        let mut exchange = topology().exchange_declaration();
        exchange.kind = ExchangeKind::Fanout;

        let err = channel
            .declare_exchange(&exchange)
            .await
            .expect_err("conflict");
        assert!(matches!(err, QueueError::TopologyConflict { .. }));
    }

    #[tokio::test]
    async fn conflicting_queue_durability_is_rejected() {
        let (_broker, channel) = declared_broker().await;
        let mut queue = topology().queue_declaration();
        queue.durable = false;

        let err = channel.declare_queue(&queue).await.expect_err("conflict");
        assert!(matches!(err, QueueError::TopologyConflict { .. }));
    }

    #[tokio::test]
    async fn direct_exchange_routes_by_exact_key() {
        let (broker, channel) = declared_broker().await;

        channel
            .publish("feed", "other.key", Publishing::persistent_json("{}"))
            .await
            .expect("unroutable publish still succeeds");
        assert_eq!(broker.depth("feed-updates"), 0);

        channel
            .publish("feed", "post.created", Publishing::persistent_json("{}"))
            .await
            .expect("publish");
        assert_eq!(broker.depth("feed-updates"), 1);
    }

    #[tokio::test]
    async fn nack_with_requeue_marks_redelivery() {
        let (_broker, channel) = declared_broker().await;
        let mut stream = channel.consume("feed-updates", "t").await.expect("consume");
        channel
            .publish("feed", "post.created", Publishing::persistent_json("x"))
            .await
            .expect("publish");

        let first = next_delivery(&mut stream).await;
        assert!(!first.redelivered());
        first.nack(true).await.expect("nack");

        let second = next_delivery(&mut stream).await;
        assert!(second.redelivered());
        assert_eq!(second.body(), b"x");
        second.ack().await.expect("ack");
    }

    #[tokio::test]
    async fn dropped_delivery_is_requeued() {
        let (broker, channel) = declared_broker().await;
        let mut stream = channel.consume("feed-updates", "t").await.expect("consume");
        channel
            .publish("feed", "post.created", Publishing::persistent_json("x"))
            .await
            .expect("publish");

        drop(next_delivery(&mut stream).await);

        assert_eq!(broker.depth("feed-updates"), 1);
    }

    #[tokio::test]
    async fn competing_consumers_share_messages() {
        let (broker, channel) = declared_broker().await;
        let other = broker.open_channel().await.expect("channel");
        let mut first = channel.consume("feed-updates", "a").await.expect("consume");
        let mut second = other.consume("feed-updates", "b").await.expect("consume");

        for body in ["1", "2"] {
            channel
                .publish("feed", "post.created", Publishing::persistent_json(body))
                .await
                .expect("publish");
        }

        let a = next_delivery(&mut first).await;
        let b = next_delivery(&mut second).await;
        assert_ne!(a.body(), b.body());
        a.ack().await.expect("ack");
        b.ack().await.expect("ack");
        assert_eq!(broker.depth("feed-updates"), 0);
    }

    #[tokio::test]
    async fn closed_channel_rejects_publish_and_ends_stream() {
        let (_broker, channel) = declared_broker().await;
        let mut stream = channel.consume("feed-updates", "t").await.expect("consume");

        channel.close().await;

        let err = channel
            .publish("feed", "post.created", Publishing::persistent_json("x"))
            .await
            .expect_err("closed");
        assert!(matches!(err, QueueError::ChannelClosed));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn unreachable_broker_rejects_publish() {
        let (broker, channel) = declared_broker().await;
        broker.set_reachable(false);

        let err = channel
            .publish("feed", "post.created", Publishing::persistent_json("x"))
            .await
            .expect_err("unreachable");
        assert!(matches!(err, QueueError::Connection(_)));
    }
}
