//! Bounded concurrent feed store.

use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};

use lru::LruCache;
use metrics::{counter, gauge};

use crate::domain::posts::Feed;
use crate::domain::types::UserId;

use crate::util::lock::{rw_read, rw_write};

use super::config::CacheConfig;

const SOURCE: &str = "cache::store";

const METRIC_HIT: &str = "murmur_feed_cache_hit_total";
const METRIC_MISS: &str = "murmur_feed_cache_miss_total";
const METRIC_EVICT: &str = "murmur_feed_cache_evict_total";
const METRIC_ENTRIES: &str = "murmur_feed_cache_entries";

/// Materialized feeds keyed by user id, with least-recently-used eviction.
///
/// Reads take the shared lock only, so concurrent reads never wait on each
/// other. Recency is refreshed on a hit only when the exclusive lock happens
/// to be free; a busy cache degrades towards least-recently-written eviction
/// instead of making readers queue. Writes replace the whole entry, and
/// readers hold an `Arc` snapshot, so a reader sees either the old feed or
/// the new one.
pub struct FeedCache {
    entries: RwLock<LruCache<UserId, Arc<Feed>>>,
}

impl FeedCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_capacity(config.capacity_non_zero())
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Cached feed for `user_id`, or `None` on a miss.
    pub fn read(&self, user_id: UserId) -> Option<Arc<Feed>> {
        let found = rw_read(&self.entries, SOURCE, "read")
            .peek(&user_id)
            .cloned();

        match found {
            Some(feed) => {
                counter!(METRIC_HIT).increment(1);
                self.promote(user_id);
                Some(feed)
            }
            None => {
                counter!(METRIC_MISS).increment(1);
                None
            }
        }
    }

    /// Replace the feed cached for `user_id`.
    pub fn write(&self, user_id: UserId, feed: Feed) {
        let mut entries = rw_write(&self.entries, SOURCE, "write");
        if let Some((evicted, _)) = entries.push(user_id, Arc::new(feed))
            && evicted != user_id
        {
            counter!(METRIC_EVICT).increment(1);
        }
        gauge!(METRIC_ENTRIES).set(entries.len() as f64);
    }

    /// Store `feed` only when nothing is cached for `user_id`.
    ///
    /// Used for feeds loaded on a miss: a refresh that landed after the load
    /// is newer and must not be replaced. Returns whether the feed was stored.
    pub fn write_if_absent(&self, user_id: UserId, feed: Feed) -> bool {
        let mut entries = rw_write(&self.entries, SOURCE, "write_if_absent");
        if entries.contains(&user_id) {
            return false;
        }
        if entries.push(user_id, Arc::new(feed)).is_some() {
            counter!(METRIC_EVICT).increment(1);
        }
        gauge!(METRIC_ENTRIES).set(entries.len() as f64);
        true
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        rw_read(&self.entries, SOURCE, "capacity").cap().get()
    }

    fn promote(&self, user_id: UserId) {
        if let Ok(mut entries) = self.entries.try_write() {
            entries.promote(&user_id);
        }
    }
}

impl Default for FeedCache {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}
