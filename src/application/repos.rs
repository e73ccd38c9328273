//! Store traits describing the persistence collaborators of the feed pipeline.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::posts::{Author, Feed, Post};
use crate::domain::types::UserId;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("database timeout")]
    Timeout,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RepoError::Persistence(_) | RepoError::Timeout | RepoError::Unavailable(_)
        )
    }
}

#[async_trait]
pub trait PostStore: Send + Sync {
    /// Posts written by `user_id`, newest first.
    async fn posts_by_user(&self, user_id: UserId) -> Result<Vec<Post>, RepoError>;

    /// Persist a post and return it as stored, including its author summary.
    async fn insert_post(&self, author_id: UserId, body: &str) -> Result<Post, RepoError>;

    /// Authoritative feed of `user_id`: posts by the user and the user's friends.
    async fn feed_for_user(&self, user_id: UserId) -> Result<Feed, RepoError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// User registered under `login`, if any.
    async fn author_by_login(&self, login: &str) -> Result<Option<Author>, RepoError>;

    /// Friends of `user_id`. Friendship is symmetric.
    async fn friends(&self, user_id: UserId) -> Result<Vec<Author>, RepoError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(RepoError::Timeout.is_transient());
        assert!(RepoError::Unavailable("down".into()).is_transient());
        assert!(RepoError::from_persistence("io").is_transient());
        assert!(!RepoError::NotFound.is_transient());
        assert!(
            !RepoError::InvalidInput {
                message: "bad".into()
            }
            .is_transient()
        );
    }
}
