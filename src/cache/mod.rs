//! Per-user feed cache.
//!
//! [`FeedCache`] is a bounded concurrent map from user id to that user's
//! materialized feed. It has no read-through behaviour of its own: the read
//! path ([`crate::application::feed::FeedService`]) populates it on a miss
//! through the supervised [`CacheWarmer`], and the consumer pool replaces
//! entries wholesale when new posts arrive.
//!
//! ## Configuration
//!
//! ```toml
//! [feed]
//! cache_capacity = 10000
//! warm_queue_limit = 1024
//! ```

mod config;
mod store;
mod warmer;

pub use config::CacheConfig;
pub use store::FeedCache;
pub use warmer::CacheWarmer;
