mod support;

use std::sync::Arc;
use std::time::Duration;

use murmur::application::posts::CreatePostError;
use murmur::domain::posts::Feed;
use murmur::queue::topology::ExchangeKind;
use murmur::queue::transport::CONTENT_TYPE_JSON;
use murmur::queue::{
    Broker, FeedConsumerPool, FeedUpdateHandler, FeedUpdateMessage, Outcome, QueueError,
};
use murmur::realtime::envelope::FEED_UPDATED;
use murmur::realtime::{Client, ConnectionPool};
use tokio::sync::watch;

use support::{Pipeline, QUEUE, eventually, next_delivery};

#[tokio::test]
async fn new_post_reaches_author_and_friend_feeds() {
    let pipeline = Pipeline::new().await;

    let post = pipeline
        .posts
        .create_post(7, "hello")
        .await
        .expect("post created");

    let queued = pipeline.broker.pending(QUEUE);
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].content_type, CONTENT_TYPE_JSON);
    let payload: serde_json::Value = serde_json::from_slice(&queued[0].body).expect("json");
    assert_eq!(payload["authorId"], 7);
    assert_eq!(payload["body"], "hello");
    assert_eq!(payload["postId"], post.id);

    let (_channel, mut stream) = pipeline.subscribe().await;
    let outcome = pipeline
        .handler()
        .handle(next_delivery(&mut stream).await)
        .await;
    assert_eq!(outcome, Outcome::Refreshed { users: 2 });

    let cached = pipeline.cache.read(7).expect("author feed cached");
    assert_eq!(cached.first(), Some(&post));

    let friend_feed = pipeline.feeds.feed_for(8).await.expect("friend feed");
    assert_eq!(friend_feed.first().map(|p| p.id), Some(post.id));
    assert!(pipeline.cache.read(9).is_none());
}

#[tokio::test]
async fn cold_read_serves_store_and_warms_cache() {
    let pipeline = Pipeline::new().await;
    assert!(pipeline.cache.read(42).is_none());

    let feed = pipeline.feeds.feed_for(42).await.expect("feed");
    assert!(feed.is_empty());

    pipeline.warmer.flush().await;
    let cached = pipeline.cache.read(42).expect("warmed");
    assert_eq!(*cached, Feed::empty());
}

#[tokio::test]
async fn refresh_during_pending_warm_is_kept() {
    let pipeline = Pipeline::new().await;
    let handler = pipeline.handler();
    let (_channel, mut stream) = pipeline.subscribe().await;

    // The miss queues an empty feed for the warmer.
    assert!(pipeline.feeds.feed_for(7).await.expect("cold feed").is_empty());

    let post = pipeline.posts.create_post(7, "hello").await.expect("post");
    handler.handle(next_delivery(&mut stream).await).await;
    pipeline.warmer.flush().await;

    let cached = pipeline.cache.read(7).expect("feed cached");
    assert_eq!(cached.first(), Some(&post));
    let served = pipeline.feeds.feed_for(7).await.expect("warm feed");
    assert_eq!(served.first().map(|p| p.id), Some(post.id));
}

#[tokio::test]
async fn served_feed_is_trimmed_to_length_cap() {
    let pipeline = Pipeline::with_length_cap(2).await;
    for n in 0..4 {
        pipeline
            .posts
            .create_post(7, &format!("post {n}"))
            .await
            .expect("post");
    }

    let feed = pipeline.feeds.feed_for(7).await.expect("feed");
    let bodies: Vec<&str> = feed.posts().iter().map(|p| p.body.as_str()).collect();
    assert_eq!(bodies, vec!["post 3", "post 2"]);
}

#[tokio::test]
async fn replayed_update_leaves_same_feed() {
    let pipeline = Pipeline::new().await;
    let post = pipeline.posts.create_post(7, "once").await.expect("post");
    let replay = FeedUpdateMessage::from(&post).to_bytes().expect("encode");
    pipeline
        .producer
        .publish(replay.into())
        .await
        .expect("republish");

    let handler = pipeline.handler();
    let (_channel, mut stream) = pipeline.subscribe().await;

    handler.handle(next_delivery(&mut stream).await).await;
    let first = pipeline.cache.read(7).expect("feed");
    handler.handle(next_delivery(&mut stream).await).await;
    let second = pipeline.cache.read(7).expect("feed");

    assert_eq!(first, second);
    assert_eq!(second.len(), 1);
}

#[tokio::test]
async fn closed_producer_reports_persisted_post() {
    let pipeline = Pipeline::new().await;
    pipeline.producer.close().await;

    let err = pipeline
        .posts
        .create_post(7, "stranded")
        .await
        .expect_err("fan-out fails");

    assert!(matches!(
        err,
        CreatePostError::FanOut {
            source: QueueError::ChannelClosed,
            ..
        }
    ));
    let stored = err.persisted_post().expect("post kept");
    assert_eq!(stored.body, "stranded");
    assert_eq!(pipeline.store.post_count(), 1);
    assert_eq!(pipeline.broker.depth(QUEUE), 0);
}

#[tokio::test]
async fn unreachable_broker_is_a_fan_out_failure() {
    let pipeline = Pipeline::new().await;
    pipeline.broker.set_reachable(false);

    let err = pipeline
        .posts
        .create_post(7, "offline")
        .await
        .expect_err("fan-out fails");

    assert!(err.persisted_post().is_some());
    assert_eq!(pipeline.store.post_count(), 1);
}

#[tokio::test]
async fn rejected_posts_have_no_side_effects() {
    let pipeline = Pipeline::new().await;

    let blank = pipeline.posts.create_post(7, "  \n").await;
    assert!(matches!(blank, Err(CreatePostError::Validation(_))));

    let bad_author = pipeline.posts.create_post(0, "hi").await;
    assert!(matches!(bad_author, Err(CreatePostError::Validation(_))));

    pipeline.store.set_available(false);
    let down = pipeline.posts.create_post(7, "hi").await;
    assert!(matches!(down, Err(CreatePostError::Persistence(_))));

    assert_eq!(pipeline.store.post_count(), 0);
    assert_eq!(pipeline.broker.depth(QUEUE), 0);
}

#[tokio::test]
async fn poison_message_is_acked_and_transient_failure_redelivered() {
    let pipeline = Pipeline::new().await;
    let handler = pipeline.handler();
    let (_channel, mut stream) = pipeline.subscribe().await;

    pipeline
        .producer
        .publish(bytes::Bytes::from_static(b"{\"postId\":"))
        .await
        .expect("publish poison");
    assert_eq!(
        handler.handle(next_delivery(&mut stream).await).await,
        Outcome::Dropped
    );
    assert_eq!(pipeline.broker.depth(QUEUE), 0);

    pipeline.posts.create_post(7, "flaky").await.expect("post");
    pipeline.store.fail_next_feed_loads(1);

    let first = next_delivery(&mut stream).await;
    assert_eq!(handler.handle(first).await, Outcome::Requeued);
    let again = next_delivery(&mut stream).await;
    assert!(again.redelivered());
    assert_eq!(
        handler.handle(again).await,
        Outcome::Refreshed { users: 2 }
    );
}

#[tokio::test]
async fn conflicting_topology_is_rejected() {
    let pipeline = Pipeline::new().await;
    let channel = pipeline.broker.open_channel().await.expect("channel");

    pipeline
        .topology
        .declare(channel.as_ref())
        .await
        .expect("identical redeclaration");

    let mut exchange = pipeline.topology.exchange_declaration();
    exchange.kind = ExchangeKind::Fanout;
    let err = channel
        .declare_exchange(&exchange)
        .await
        .expect_err("conflict");
    assert!(matches!(err, QueueError::TopologyConflict { .. }));
}

#[tokio::test]
async fn consumer_pool_refreshes_and_pushes_to_live_connections() {
    let pipeline = Pipeline::new().await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (pool, connections) = ConnectionPool::new(shutdown_rx.clone());
    let pool_task = pool.spawn();
    let (client, mut session) = Client::new("user8", 8);
    connections.register(client).await.expect("register");

    let handler = Arc::new(
        FeedUpdateHandler::new(
            pipeline.cache.clone(),
            pipeline.store.clone(),
            pipeline.store.clone(),
        )
        .with_notifier(connections.clone()),
    );
    let consumers =
        FeedConsumerPool::start(&pipeline.broker, &pipeline.topology, 2, handler, shutdown_rx)
            .await
            .expect("consumers");

    let post = pipeline.posts.create_post(7, "live").await.expect("post");

    let envelope = tokio::time::timeout(Duration::from_secs(1), session.outbound.recv())
        .await
        .expect("push within timeout")
        .expect("envelope");
    assert_eq!(envelope.kind, FEED_UPDATED);
    assert_eq!(envelope.data["id"], post.id);

    let cache = pipeline.cache.clone();
    eventually(|| cache.read(8).is_some()).await;

    shutdown_tx.send(true).expect("shutdown");
    consumers.join().await;
    pool_task.await.expect("pool stops");
    assert!(session.closed.await.is_ok());
}
