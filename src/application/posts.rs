//! Write path for posts: persist, then fan the event out to the queue.

use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::application::repos::{PostStore, RepoError};
use crate::domain::error::DomainError;
use crate::domain::posts::Post;
use crate::domain::types::{UserId, is_valid_user_id};
use crate::queue::{FeedProducer, FeedUpdateMessage, QueueError};

const METRIC_FANOUT_FAILED: &str = "murmur_post_fanout_failed_total";

#[derive(Debug, Error)]
pub enum CreatePostError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error("failed to persist post: {0}")]
    Persistence(#[source] RepoError),
    /// The post is stored; only the feed fan-out failed.
    #[error("post {id} persisted but fan-out failed: {source}", id = .post.id)]
    FanOut {
        post: Box<Post>,
        #[source]
        source: QueueError,
    },
}

impl CreatePostError {
    /// The stored post, when the failure happened after persistence.
    pub fn persisted_post(&self) -> Option<&Post> {
        match self {
            CreatePostError::FanOut { post, .. } => Some(post.as_ref()),
            _ => None,
        }
    }
}

fn validate_new_post(author_id: UserId, body: &str) -> Result<(), DomainError> {
    if !is_valid_user_id(author_id) {
        return Err(DomainError::InvalidUserId(author_id));
    }
    if body.trim().is_empty() {
        return Err(DomainError::validation("post body must not be empty"));
    }
    Ok(())
}

pub struct PostOrchestrator {
    posts: Arc<dyn PostStore>,
    producer: Arc<FeedProducer>,
}

impl PostOrchestrator {
    pub fn new(posts: Arc<dyn PostStore>, producer: Arc<FeedProducer>) -> Self {
        Self { posts, producer }
    }

    /// Validate, persist, and announce a new post.
    ///
    /// Validation and persistence failures have no side effects. A publish
    /// failure leaves the post stored and is reported as
    /// [`CreatePostError::FanOut`].
    #[instrument(skip(self, body), fields(bytes = body.len()))]
    pub async fn create_post(&self, author_id: UserId, body: &str) -> Result<Post, CreatePostError> {
        validate_new_post(author_id, body)?;

        let post = self
            .posts
            .insert_post(author_id, body)
            .await
            .map_err(CreatePostError::Persistence)?;

        let message = FeedUpdateMessage::from(&post);
        if let Err(source) = self.producer.publish_message(&message).await {
            counter!(METRIC_FANOUT_FAILED).increment(1);
            warn!(post_id = post.id, error = %source, "Post stored but feed fan-out failed");
            return Err(CreatePostError::FanOut {
                post: Box::new(post),
                source,
            });
        }

        info!(post_id = post.id, "Post created");
        Ok(post)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_positive_author() {
        assert!(matches!(
            validate_new_post(0, "hello"),
            Err(DomainError::InvalidUserId(0))
        ));
        assert!(matches!(
            validate_new_post(-3, "hello"),
            Err(DomainError::InvalidUserId(-3))
        ));
    }

    #[test]
    fn rejects_blank_body() {
        assert!(matches!(
            validate_new_post(7, ""),
            Err(DomainError::Validation { .. })
        ));
        assert!(matches!(
            validate_new_post(7, "  \n\t"),
            Err(DomainError::Validation { .. })
        ));
    }

    #[test]
    fn accepts_valid_post() {
        assert!(validate_new_post(7, "hello").is_ok());
    }
}
