use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument};

use crate::application::repos::{PostStore, RepoError};
use crate::cache::{CacheWarmer, FeedCache};
use crate::domain::error::DomainError;
use crate::domain::posts::Feed;
use crate::domain::types::{UserId, is_valid_user_id};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Read path for feeds: cache first, store on a miss.
pub struct FeedService {
    cache: Arc<FeedCache>,
    posts: Arc<dyn PostStore>,
    warmer: Arc<CacheWarmer>,
    length_cap: usize,
}

impl FeedService {
    pub fn new(
        cache: Arc<FeedCache>,
        posts: Arc<dyn PostStore>,
        warmer: Arc<CacheWarmer>,
        length_cap: usize,
    ) -> Self {
        Self {
            cache,
            posts,
            warmer,
            length_cap,
        }
    }

    /// Feed of `user_id`, trimmed to the most recent `length_cap` posts.
    ///
    /// On a miss the authoritative feed is loaded from the store and handed to
    /// the warmer, so the response does not wait on the cache write.
    #[instrument(skip(self))]
    pub async fn feed_for(&self, user_id: UserId) -> Result<Feed, FeedError> {
        if !is_valid_user_id(user_id) {
            return Err(DomainError::InvalidUserId(user_id).into());
        }

        if let Some(cached) = self.cache.read(user_id) {
            return Ok(cached.trimmed(self.length_cap));
        }

        let feed = self.posts.feed_for_user(user_id).await?;
        debug!(posts = feed.len(), "Feed loaded from store");
        let served = feed.trimmed(self.length_cap);
        self.warmer.populate(user_id, feed);
        Ok(served)
    }

    pub fn length_cap(&self) -> usize {
        self.length_cap
    }
}
