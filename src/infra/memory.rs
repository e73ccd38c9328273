//! In-memory store for single-process runs and tests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use time::OffsetDateTime;

use crate::application::repos::{PostStore, RepoError, UserStore};
use crate::domain::posts::{Author, DEFAULT_FEED_LENGTH_CAP, Feed, Post};
use crate::domain::types::UserId;

pub struct MemoryStore {
    users: DashMap<UserId, Author>,
    friends: DashMap<UserId, BTreeSet<UserId>>,
    posts: DashMap<UserId, Vec<Post>>,
    next_post_id: AtomicI64,
    feed_limit: usize,
    available: AtomicBool,
    failing_feed_loads: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            users: DashMap::new(),
            friends: DashMap::new(),
            posts: DashMap::new(),
            next_post_id: AtomicI64::new(1),
            feed_limit: DEFAULT_FEED_LENGTH_CAP,
            available: AtomicBool::new(true),
            failing_feed_loads: AtomicUsize::new(0),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feed_limit(mut self, limit: usize) -> Self {
        self.feed_limit = limit.max(1);
        self
    }

    pub fn add_user(&self, author: Author) {
        self.users.insert(author.id, author);
    }

    /// Make `a` and `b` friends of each other.
    pub fn add_friendship(&self, a: UserId, b: UserId) {
        self.friends.entry(a).or_default().insert(b);
        self.friends.entry(b).or_default().insert(a);
    }

    /// Store a post with an explicit timestamp.
    pub fn seed_post(
        &self,
        author_id: UserId,
        body: &str,
        created_at: OffsetDateTime,
    ) -> Result<Post, RepoError> {
        let author = self.users.get(&author_id).map(|entry| entry.value().clone()).ok_or_else(|| {
            RepoError::InvalidInput {
                message: format!("unknown author {author_id}"),
            }
        })?;

        let post = Post {
            id: self.next_post_id.fetch_add(1, Ordering::SeqCst),
            created_at,
            updated_at: created_at,
            body: body.to_string(),
            author,
        };
        self.posts.entry(author_id).or_default().push(post.clone());
        Ok(post)
    }

    /// Make every operation fail as if the store were down.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `count` feed loads with a transient error.
    pub fn fail_next_feed_loads(&self, count: usize) {
        self.failing_feed_loads.store(count, Ordering::SeqCst);
    }

    pub fn post_count(&self) -> usize {
        self.posts.iter().map(|entry| entry.value().len()).sum()
    }

    fn ensure_available(&self) -> Result<(), RepoError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RepoError::Unavailable("memory store disabled".to_string()))
        }
    }

    fn take_feed_failure(&self) -> bool {
        self.failing_feed_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }

    fn friend_ids(&self, user_id: UserId) -> Vec<UserId> {
        self.friends
            .get(&user_id)
            .map(|entry| entry.value().iter().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PostStore for MemoryStore {
    async fn posts_by_user(&self, user_id: UserId) -> Result<Vec<Post>, RepoError> {
        self.ensure_available()?;
        let posts = self
            .posts
            .get(&user_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();
        Ok(Feed::from_posts(posts).into_posts())
    }

    async fn insert_post(&self, author_id: UserId, body: &str) -> Result<Post, RepoError> {
        self.ensure_available()?;
        self.seed_post(author_id, body, OffsetDateTime::now_utc())
    }

    async fn feed_for_user(&self, user_id: UserId) -> Result<Feed, RepoError> {
        self.ensure_available()?;
        if self.take_feed_failure() {
            return Err(RepoError::Unavailable("injected feed load failure".to_string()));
        }

        let mut posts = Vec::new();
        for author_id in std::iter::once(user_id).chain(self.friend_ids(user_id)) {
            if let Some(entry) = self.posts.get(&author_id) {
                posts.extend(entry.value().iter().cloned());
            }
        }

        let mut feed = Feed::from_posts(posts);
        feed.truncate(self.feed_limit);
        Ok(feed)
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn author_by_login(&self, login: &str) -> Result<Option<Author>, RepoError> {
        self.ensure_available()?;
        Ok(self
            .users
            .iter()
            .find(|entry| entry.value().login == login)
            .map(|entry| entry.value().clone()))
    }

    async fn friends(&self, user_id: UserId) -> Result<Vec<Author>, RepoError> {
        self.ensure_available()?;
        Ok(self
            .friend_ids(user_id)
            .into_iter()
            .filter_map(|id| self.users.get(&id).map(|entry| entry.value().clone()))
            .collect())
    }
}
