//! Consuming side of the feed-update queue.
//!
//! Each worker owns a channel and a subscription on the shared queue, so the
//! broker spreads messages across workers. A message is acknowledged only
//! after every affected feed has been recomputed and written; transient
//! store failures send it back for redelivery. Because feeds are recomputed
//! from the store rather than appended to, replays converge. Errors on the
//! subscription itself are not fatal: the worker backs off and keeps reading
//! until the stream ends or shutdown is signalled.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::application::repos::{PostStore, RepoError, UserStore};
use crate::cache::FeedCache;
use crate::domain::posts::Author;
use crate::realtime::{Envelope, PoolHandle};

use super::message::FeedUpdateMessage;
use super::topology::FeedTopology;
use super::transport::{Broker, BrokerChannel, Delivery, DeliveryStream, QueueError};

const METRIC_UPDATES: &str = "murmur_feed_updates_total";
const METRIC_REFRESH_SECONDS: &str = "murmur_feed_refresh_seconds";
const METRIC_SUBSCRIPTION_ERRORS: &str = "murmur_feed_subscription_errors_total";

/// Subscription errors are retried on the same stream after a pause that
/// doubles up to [`MAX_ERROR_BACKOFF`] and resets on the next delivery.
const INITIAL_ERROR_BACKOFF: Duration = Duration::from_millis(100);
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// How a single delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Feeds recomputed and the message acknowledged.
    Refreshed { users: usize },
    /// Undecodable payload, acknowledged and discarded.
    Dropped,
    /// Transient failure, returned to the queue.
    Requeued,
    /// Permanent failure, rejected without requeue.
    Rejected,
    /// Feeds recomputed but the acknowledgement did not reach the broker.
    AckFailed,
}

impl Outcome {
    fn as_str(self) -> &'static str {
        match self {
            Outcome::Refreshed { .. } => "refreshed",
            Outcome::Dropped => "dropped",
            Outcome::Requeued => "requeued",
            Outcome::Rejected => "rejected",
            Outcome::AckFailed => "ack_failed",
        }
    }
}

pub struct FeedUpdateHandler {
    cache: Arc<FeedCache>,
    posts: Arc<dyn PostStore>,
    users: Arc<dyn UserStore>,
    notifier: Option<PoolHandle>,
}

impl FeedUpdateHandler {
    pub fn new(cache: Arc<FeedCache>, posts: Arc<dyn PostStore>, users: Arc<dyn UserStore>) -> Self {
        Self {
            cache,
            posts,
            users,
            notifier: None,
        }
    }

    /// Push a feed-updated envelope to affected users after each refresh.
    pub fn with_notifier(mut self, pool: PoolHandle) -> Self {
        self.notifier = Some(pool);
        self
    }

    /// Recompute and store every feed touched by `message`.
    ///
    /// Returns the affected users: the author first, then the author's friends.
    pub async fn refresh(&self, message: &FeedUpdateMessage) -> Result<Vec<Author>, RepoError> {
        let affected = self.affected_users(message).await?;
        for user in &affected {
            let feed = self.posts.feed_for_user(user.id).await?;
            debug!(user_id = user.id, posts = feed.len(), "Feed recomputed");
            self.cache.write(user.id, feed);
        }
        Ok(affected)
    }

    async fn affected_users(&self, message: &FeedUpdateMessage) -> Result<Vec<Author>, RepoError> {
        let mut affected = vec![message.author.clone()];
        for friend in self.users.friends(message.author_id).await? {
            if affected.iter().all(|user| user.id != friend.id) {
                affected.push(friend);
            }
        }
        Ok(affected)
    }

    /// Process one delivery and settle it with the broker.
    pub async fn handle(&self, delivery: Delivery) -> Outcome {
        let outcome = self.process(delivery).await;
        counter!(METRIC_UPDATES, "outcome" => outcome.as_str()).increment(1);
        outcome
    }

    async fn process(&self, delivery: Delivery) -> Outcome {
        let redelivered = delivery.redelivered();
        let message = match FeedUpdateMessage::decode(delivery.body()) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, redelivered, "Dropping undecodable feed update");
                if let Err(err) = delivery.ack().await {
                    warn!(error = %err, "Failed to ack undecodable feed update");
                }
                return Outcome::Dropped;
            }
        };

        let post_id = message.post_id;
        let author_id = message.author_id;
        let started = Instant::now();

        match self.refresh(&message).await {
            Ok(affected) => {
                histogram!(METRIC_REFRESH_SECONDS).record(started.elapsed().as_secs_f64());
                if let Err(err) = delivery.ack().await {
                    warn!(post_id, author_id, error = %err, "Feed update ack failed; expecting redelivery");
                    return Outcome::AckFailed;
                }
                debug!(post_id, author_id, users = affected.len(), redelivered, "Feed update applied");
                self.notify(&message, &affected).await;
                Outcome::Refreshed {
                    users: affected.len(),
                }
            }
            Err(err) if err.is_transient() => {
                warn!(post_id, author_id, error = %err, "Feed refresh failed; requeueing");
                if let Err(err) = delivery.nack(true).await {
                    warn!(post_id, error = %err, "Feed update nack failed");
                }
                Outcome::Requeued
            }
            Err(err) => {
                error!(post_id, author_id, error = %err, "Feed refresh failed permanently; rejecting");
                if let Err(err) = delivery.nack(false).await {
                    warn!(post_id, error = %err, "Feed update reject failed");
                }
                Outcome::Rejected
            }
        }
    }

    async fn notify(&self, message: &FeedUpdateMessage, affected: &[Author]) {
        let Some(pool) = self.notifier.as_ref() else {
            return;
        };
        let envelope = match Envelope::feed_updated(&message.to_post()) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(post_id = message.post_id, error = %err, "Failed to encode feed envelope");
                return;
            }
        };
        for user in affected {
            pool.notify(&user.login, envelope.clone()).await;
        }
    }
}

/// Fixed set of workers consuming the feed-update queue.
pub struct FeedConsumerPool {
    workers: Vec<JoinHandle<()>>,
}

impl FeedConsumerPool {
    /// Open one channel and subscription per worker and start them.
    pub async fn start(
        broker: &dyn Broker,
        topology: &FeedTopology,
        workers: usize,
        handler: Arc<FeedUpdateHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, QueueError> {
        let count = workers.max(1);
        let mut pool = Self {
            workers: Vec::with_capacity(count),
        };

        for worker in 0..count {
            let subscription = async {
                let channel = broker.open_channel().await?;
                let tag = format!("murmur-feed-{worker}");
                let deliveries = channel.consume(&topology.queue, &tag).await?;
                Ok::<_, QueueError>((channel, deliveries))
            }
            .await;

            let (channel, deliveries) = match subscription {
                Ok(subscription) => subscription,
                Err(err) => {
                    error!(worker, error = %err, "Failed to start feed consumer worker");
                    pool.abort();
                    return Err(err);
                }
            };

            let task = run_worker(channel, deliveries, handler.clone(), shutdown.clone())
                .instrument(info_span!("feed_consumer", worker));
            pool.workers.push(tokio::spawn(task));
        }

        info!(workers = count, queue = %topology.queue, "Feed consumer pool started");
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker to finish.
    pub async fn join(self) {
        for (worker, handle) in self.workers.into_iter().enumerate() {
            match handle.await {
                Ok(()) => {}
                Err(err) if err.is_panic() => {
                    error!(worker, error = %err, "Feed consumer worker panicked")
                }
                Err(err) => warn!(worker, error = %err, "Feed consumer worker cancelled"),
            }
        }
        info!("Feed consumer pool stopped");
    }

    fn abort(&mut self) {
        for handle in self.workers.drain(..) {
            handle.abort();
        }
    }
}

async fn run_worker(
    channel: Box<dyn BrokerChannel>,
    mut deliveries: Box<dyn DeliveryStream>,
    handler: Arc<FeedUpdateHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Feed consumer worker started");
    let mut backoff = INITIAL_ERROR_BACKOFF;
    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            next = deliveries.next() => match next {
                // The in-flight message is settled before shutdown is observed again.
                Some(Ok(delivery)) => {
                    handler.handle(delivery).await;
                    backoff = INITIAL_ERROR_BACKOFF;
                }
                Some(Err(err)) => {
                    counter!(METRIC_SUBSCRIPTION_ERRORS).increment(1);
                    warn!(error = %err, retry_in_ms = backoff.as_millis() as u64, "Feed subscription error");
                    if !pause(backoff, &mut shutdown).await {
                        break;
                    }
                    backoff = (backoff * 2).min(MAX_ERROR_BACKOFF);
                }
                None => {
                    warn!("Feed subscription ended");
                    break;
                }
            },
        }
    }

    drop(deliveries);
    channel.close().await;
    info!("Feed consumer worker stopped");
}

/// Sleep for `delay` unless shutdown comes first. Returns `false` on shutdown.
async fn pause(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown.wait_for(|stop| *stop) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::domain::posts::fixtures::author;
    use crate::domain::types::UserId;
    use crate::infra::memory::MemoryStore;
    use crate::queue::memory::MemoryBroker;
    use crate::queue::transport::Publishing;
    use crate::realtime::{Client, ConnectionPool, envelope::FEED_UPDATED};

    const QUEUE: &str = "feed-updates";

    struct BrokenUsers;

    #[async_trait]
    impl UserStore for BrokenUsers {
        async fn author_by_login(&self, _login: &str) -> Result<Option<Author>, RepoError> {
            Ok(None)
        }

        async fn friends(&self, _user_id: UserId) -> Result<Vec<Author>, RepoError> {
            Err(RepoError::InvalidInput {
                message: "corrupt friendship row".to_string(),
            })
        }
    }

    /// Fails once with a subscription error, then reads from `inner`.
    struct FlakyStream {
        inner: Box<dyn DeliveryStream>,
        failed: bool,
    }

    #[async_trait]
    impl DeliveryStream for FlakyStream {
        async fn next(&mut self) -> Option<Result<Delivery, QueueError>> {
            if !self.failed {
                self.failed = true;
                return Some(Err(QueueError::Subscribe("missed heartbeat".to_string())));
            }
            self.inner.next().await
        }
    }

    fn cache(capacity: usize) -> Arc<FeedCache> {
        Arc::new(FeedCache::with_capacity(
            std::num::NonZeroUsize::new(capacity).expect("non-zero capacity"),
        ))
    }

    fn store() -> Arc<MemoryStore> {
        let store = MemoryStore::new();
        for id in [7, 8, 9] {
            store.add_user(author(id));
        }
        store.add_friendship(7, 8);
        Arc::new(store)
    }

    async fn subscribed() -> (MemoryBroker, Box<dyn BrokerChannel>, Box<dyn DeliveryStream>) {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.expect("channel");
        let topology = FeedTopology::new("feed", QUEUE, "post.created");
        topology.declare(channel.as_ref()).await.expect("declare");
        let stream = channel.consume(QUEUE, "test").await.expect("consume");
        (broker, channel, stream)
    }

    async fn publish(channel: &dyn BrokerChannel, body: Vec<u8>) {
        channel
            .publish("feed", "post.created", Publishing::persistent_json(body))
            .await
            .expect("publish");
    }

    async fn next_delivery(stream: &mut Box<dyn DeliveryStream>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("delivery within timeout")
            .expect("stream open")
            .expect("delivery")
    }

    async fn post_event(store: &MemoryStore, author_id: UserId, body: &str) -> Vec<u8> {
        let post = store.insert_post(author_id, body).await.expect("insert");
        FeedUpdateMessage::from(&post).to_bytes().expect("encode")
    }

    #[tokio::test]
    async fn refresh_covers_author_and_friends_only() {
        let store = store();
        let cache = cache(16);
        let handler = FeedUpdateHandler::new(cache.clone(), store.clone(), store.clone());
        let (broker, channel, mut stream) = subscribed().await;

        publish(channel.as_ref(), post_event(&store, 7, "hello").await).await;
        let outcome = handler.handle(next_delivery(&mut stream).await).await;

        assert_eq!(outcome, Outcome::Refreshed { users: 2 });
        for user_id in [7, 8] {
            let feed = cache.read(user_id).expect("feed cached");
            assert_eq!(feed.first().map(|p| p.body.as_str()), Some("hello"));
        }
        assert!(cache.read(9).is_none());
        assert_eq!(broker.depth(QUEUE), 0);
    }

    #[tokio::test]
    async fn undecodable_payload_is_acked_and_dropped() {
        let store = store();
        let cache = cache(1);
        let handler = FeedUpdateHandler::new(cache.clone(), store.clone(), store);
        let (broker, channel, mut stream) = subscribed().await;

        publish(channel.as_ref(), b"not json".to_vec()).await;
        let outcome = handler.handle(next_delivery(&mut stream).await).await;

        assert_eq!(outcome, Outcome::Dropped);
        assert_eq!(broker.depth(QUEUE), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn transient_failure_is_requeued_then_applied() {
        let store = store();
        let cache = cache(4);
        let handler = FeedUpdateHandler::new(cache.clone(), store.clone(), store.clone());
        let (_broker, channel, mut stream) = subscribed().await;

        publish(channel.as_ref(), post_event(&store, 7, "retry me").await).await;
        store.fail_next_feed_loads(1);

        let first = next_delivery(&mut stream).await;
        assert!(!first.redelivered());
        assert_eq!(handler.handle(first).await, Outcome::Requeued);

        let second = next_delivery(&mut stream).await;
        assert!(second.redelivered());
        assert_eq!(handler.handle(second).await, Outcome::Refreshed { users: 2 });
        assert!(cache.read(7).is_some());
    }

    #[tokio::test]
    async fn permanent_failure_is_rejected() {
        let store = store();
        let cache = cache(1);
        let handler = FeedUpdateHandler::new(cache.clone(), store.clone(), Arc::new(BrokenUsers));
        let (broker, channel, mut stream) = subscribed().await;

        publish(channel.as_ref(), post_event(&store, 7, "doomed").await).await;
        let outcome = handler.handle(next_delivery(&mut stream).await).await;

        assert_eq!(outcome, Outcome::Rejected);
        assert_eq!(broker.depth(QUEUE), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn refreshed_users_with_live_connections_are_notified() {
        let store = store();
        let cache = cache(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (pool, connections) = ConnectionPool::new(shutdown_rx);
        let _pool_task = pool.spawn();

        let (client, mut session) = Client::new("user8", 4);
        connections.register(client).await.expect("register");
        assert!(connections.is_connected("user8").await);

        let handler = FeedUpdateHandler::new(cache, store.clone(), store.clone())
            .with_notifier(connections.clone());
        let (_broker, channel, mut stream) = subscribed().await;

        publish(channel.as_ref(), post_event(&store, 7, "ping").await).await;
        handler.handle(next_delivery(&mut stream).await).await;

        let envelope = tokio::time::timeout(Duration::from_secs(1), session.outbound.recv())
            .await
            .expect("notification within timeout")
            .expect("envelope");
        assert_eq!(envelope.kind, FEED_UPDATED);
        assert_eq!(envelope.data["body"], "ping");
        assert_eq!(envelope.data["author"]["id"], 7);
    }

    #[tokio::test]
    async fn worker_survives_subscription_error() {
        let store = store();
        let cache = cache(4);
        let handler = Arc::new(FeedUpdateHandler::new(cache.clone(), store.clone(), store.clone()));
        let (broker, channel, stream) = subscribed().await;
        publish(channel.as_ref(), post_event(&store, 7, "after hiccup").await).await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flaky = Box::new(FlakyStream {
            inner: stream,
            failed: false,
        });
        let worker = tokio::spawn(run_worker(channel, flaky, handler, shutdown_rx));

        tokio::time::timeout(Duration::from_secs(2), async {
            while cache.read(7).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("update applied after the error");
        assert_eq!(broker.depth(QUEUE), 0);
        assert!(!worker.is_finished());

        shutdown_tx.send(true).expect("signal");
        tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .expect("worker stops")
            .expect("worker task");
    }

    #[tokio::test]
    async fn shutdown_interrupts_error_backoff() {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).expect("signal");

        let resumed = tokio::time::timeout(
            Duration::from_secs(1),
            pause(MAX_ERROR_BACKOFF, &mut shutdown_rx),
        )
        .await
        .expect("pause returns before the backoff elapses");
        assert!(!resumed);
    }

    #[tokio::test]
    async fn workers_stop_on_shutdown() {
        let store = store();
        let cache = cache(4);
        let handler = Arc::new(FeedUpdateHandler::new(cache.clone(), store.clone(), store.clone()));
        let broker = MemoryBroker::new();
        let topology = FeedTopology::new("feed", QUEUE, "post.created");
        let channel = broker.open_channel().await.expect("channel");
        topology.declare(channel.as_ref()).await.expect("declare");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pool = FeedConsumerPool::start(&broker, &topology, 3, handler, shutdown_rx)
            .await
            .expect("start");
        assert_eq!(pool.len(), 3);

        publish(channel.as_ref(), post_event(&store, 7, "async").await).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while cache.read(7).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("feed refreshed by a worker");

        shutdown_tx.send(true).expect("signal");
        tokio::time::timeout(Duration::from_secs(1), pool.join())
            .await
            .expect("workers stop");
    }
}
