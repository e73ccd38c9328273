//! Wire format of feed-update events.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::domain::posts::{Author, Post};
use crate::domain::types::{PostId, UserId, is_valid_user_id};

/// Event announcing that `author_id` published a post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedUpdateMessage {
    pub post_id: PostId,
    pub author_id: UserId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub body: String,
    pub author: Author,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed feed update: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("feed update names invalid author id {0}")]
    InvalidAuthor(UserId),
    #[error("feed update author {author_id} disagrees with author summary {summary_id}")]
    AuthorMismatch { author_id: UserId, summary_id: UserId },
}

impl FeedUpdateMessage {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode and sanity-check an event payload.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let message: Self = serde_json::from_slice(payload)?;
        if !is_valid_user_id(message.author_id) {
            return Err(DecodeError::InvalidAuthor(message.author_id));
        }
        if message.author.id != message.author_id {
            return Err(DecodeError::AuthorMismatch {
                author_id: message.author_id,
                summary_id: message.author.id,
            });
        }
        Ok(message)
    }

    /// The post this event announces, as shown in a feed.
    pub fn to_post(&self) -> Post {
        Post {
            id: self.post_id,
            created_at: self.created_at,
            updated_at: self.created_at,
            body: self.body.clone(),
            author: self.author.clone(),
        }
    }
}

impl From<&Post> for FeedUpdateMessage {
    fn from(post: &Post) -> Self {
        Self {
            post_id: post.id,
            author_id: post.author.id,
            created_at: post.created_at,
            body: post.body.clone(),
            author: post.author.clone(),
        }
    }
}
