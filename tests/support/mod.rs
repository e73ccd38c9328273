#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use murmur::application::feed::FeedService;
use murmur::application::posts::PostOrchestrator;
use murmur::cache::{CacheConfig, CacheWarmer, FeedCache};
use murmur::domain::posts::{Author, DEFAULT_FEED_LENGTH_CAP};
use murmur::domain::types::UserId;
use murmur::infra::memory::MemoryStore;
use murmur::queue::transport::DeliveryStream;
use murmur::queue::{
    Broker, BrokerChannel, Delivery, FeedProducer, FeedTopology, FeedUpdateHandler, MemoryBroker,
};

pub const EXCHANGE: &str = "feed";
pub const QUEUE: &str = "feed-updates";
pub const ROUTING_KEY: &str = "post.created";

pub fn author(id: UserId) -> Author {
    Author {
        id,
        first_name: format!("First{id}"),
        last_name: format!("Last{id}"),
        login: format!("user{id}"),
    }
}

/// Users 7, 8 and 9; 7 is friends with 8 only.
pub fn seeded_store() -> Arc<MemoryStore> {
    let store = MemoryStore::new();
    for id in [7, 8, 9] {
        store.add_user(author(id));
    }
    store.add_friendship(7, 8);
    Arc::new(store)
}

/// Every stage of the feed pipeline wired over in-memory adapters.
pub struct Pipeline {
    pub store: Arc<MemoryStore>,
    pub broker: MemoryBroker,
    pub topology: FeedTopology,
    pub cache: Arc<FeedCache>,
    pub warmer: Arc<CacheWarmer>,
    pub producer: Arc<FeedProducer>,
    pub posts: Arc<PostOrchestrator>,
    pub feeds: Arc<FeedService>,
}

impl Pipeline {
    pub async fn new() -> Self {
        Self::with_length_cap(DEFAULT_FEED_LENGTH_CAP).await
    }

    pub async fn with_length_cap(length_cap: usize) -> Self {
        let store = seeded_store();
        let broker = MemoryBroker::new();
        let topology = FeedTopology::new(EXCHANGE, QUEUE, ROUTING_KEY);

        let setup = broker.open_channel().await.expect("channel");
        topology.declare(setup.as_ref()).await.expect("declare");
        setup.close().await;

        let config = CacheConfig {
            capacity: 64,
            warm_queue_limit: 16,
        };
        let cache = Arc::new(FeedCache::new(&config));
        let warmer = Arc::new(CacheWarmer::spawn(cache.clone(), &config));
        let producer = Arc::new(
            FeedProducer::connect(&broker, &topology)
                .await
                .expect("producer"),
        );
        let posts = Arc::new(PostOrchestrator::new(store.clone(), producer.clone()));
        let feeds = Arc::new(FeedService::new(
            cache.clone(),
            store.clone(),
            warmer.clone(),
            length_cap,
        ));

        Self {
            store,
            broker,
            topology,
            cache,
            warmer,
            producer,
            posts,
            feeds,
        }
    }

    pub fn handler(&self) -> FeedUpdateHandler {
        FeedUpdateHandler::new(self.cache.clone(), self.store.clone(), self.store.clone())
    }

    /// A consuming channel and its delivery stream. Keep the channel alive
    /// while reading from the stream.
    pub async fn subscribe(&self) -> (Box<dyn BrokerChannel>, Box<dyn DeliveryStream>) {
        let channel = self.broker.open_channel().await.expect("channel");
        let stream = channel.consume(QUEUE, "test").await.expect("consume");
        (channel, stream)
    }
}

pub async fn next_delivery(stream: &mut Box<dyn DeliveryStream>) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("delivery within timeout")
        .expect("stream open")
        .expect("delivery")
}

/// Poll `condition` until it holds, failing after a second.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(1), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached within timeout");
}
