//! Posts and the per-user feed built from them.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::types::{PostId, UserId};

/// Maximum number of posts served in a single feed.
pub const DEFAULT_FEED_LENGTH_CAP: usize = 1000;

/// Public summary of the user who wrote a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub id: UserId,
    pub first_name: String,
    pub last_name: String,
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    pub id: PostId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub body: String,
    pub author: Author,
}

/// Newest-first ordering; equal timestamps fall back to the higher id first.
fn newest_first(a: &Post, b: &Post) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.id.cmp(&a.id))
}

/// Ordered list of posts presented to a user, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Feed {
    posts: Vec<Post>,
}

impl Feed {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a feed from posts in any order.
    pub fn from_posts(mut posts: Vec<Post>) -> Self {
        posts.sort_by(newest_first);
        Self { posts }
    }

    pub fn posts(&self) -> &[Post] {
        &self.posts
    }

    pub fn into_posts(self) -> Vec<Post> {
        self.posts
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    pub fn first(&self) -> Option<&Post> {
        self.posts.first()
    }

    /// Copy of this feed holding at most `cap` of the most recent posts.
    pub fn trimmed(&self, cap: usize) -> Feed {
        let keep = self.posts.len().min(cap);
        Feed {
            posts: self.posts[..keep].to_vec(),
        }
    }

    /// In-place variant of [`Feed::trimmed`].
    pub fn truncate(&mut self, cap: usize) {
        self.posts.truncate(cap);
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::post;
    use super::*;

    #[test]
    fn from_posts_orders_newest_first() {
        let feed = Feed::from_posts(vec![post(1, 1), post(3, 1), post(2, 2)]);
        let ids: Vec<PostId> = feed.posts().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn equal_timestamps_order_by_id() {
        let mut a = post(5, 1);
        let b = post(9, 1);
        a.created_at = b.created_at;
        let feed = Feed::from_posts(vec![a, b]);
        assert_eq!(feed.first().map(|p| p.id), Some(9));
    }

    #[test]
    fn trimmed_keeps_most_recent_entries() {
        let posts: Vec<Post> = (1..=1500).map(|id| post(id, 1)).collect();
        let feed = Feed::from_posts(posts);

        let served = feed.trimmed(DEFAULT_FEED_LENGTH_CAP);

        assert_eq!(served.len(), 1000);
        assert_eq!(served.first().map(|p| p.id), Some(1500));
        assert_eq!(served.posts().last().map(|p| p.id), Some(501));
        assert!(
            served
                .posts()
                .windows(2)
                .all(|pair| pair[0].created_at >= pair[1].created_at)
        );
    }

    #[test]
    fn trimmed_shorter_feed_is_unchanged() {
        let feed = Feed::from_posts(vec![post(1, 1), post(2, 1)]);
        assert_eq!(feed.trimmed(1000), feed);
    }

    #[test]
    fn post_serializes_camel_case_with_rfc3339() {
        let value = serde_json::to_value(post(1, 7)).expect("serialize post");
        assert_eq!(value["author"]["firstName"], "First7");
        assert_eq!(value["createdAt"], "2023-11-14T22:13:21Z");
        assert!(value.get("updatedAt").is_some());
    }
}
