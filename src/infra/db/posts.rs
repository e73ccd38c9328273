use async_trait::async_trait;
use sqlx::query_as;

use crate::application::repos::{PostStore, RepoError};
use crate::domain::posts::{Feed, Post};
use crate::domain::types::UserId;

use super::rows::PostRow;
use super::{PostgresRepositories, timed};

const POSTS_BY_USER_SQL: &str = r#"
    SELECT p.id, p.created_at, p.updated_at, p.body,
           u.id AS author_id, u.first_name, u.last_name, u.login
    FROM posts p
    JOIN users u ON u.id = p.user_id
    WHERE p.user_id = $1
    ORDER BY p.created_at DESC, p.id DESC
"#;

const INSERT_POST_SQL: &str = r#"
    WITH inserted AS (
        INSERT INTO posts (user_id, body)
        VALUES ($1, $2)
        RETURNING id, user_id, created_at, updated_at, body
    )
    SELECT i.id, i.created_at, i.updated_at, i.body,
           u.id AS author_id, u.first_name, u.last_name, u.login
    FROM inserted i
    JOIN users u ON u.id = i.user_id
"#;

const FEED_FOR_USER_SQL: &str = r#"
    SELECT p.id, p.created_at, p.updated_at, p.body,
           u.id AS author_id, u.first_name, u.last_name, u.login
    FROM posts p
    JOIN users u ON u.id = p.user_id
    WHERE p.user_id = $1
       OR p.user_id IN (SELECT f.friend_id FROM friends f WHERE f.user_id = $1)
    ORDER BY p.created_at DESC, p.id DESC
    LIMIT $2
"#;

#[async_trait]
impl PostStore for PostgresRepositories {
    async fn posts_by_user(&self, user_id: UserId) -> Result<Vec<Post>, RepoError> {
        let rows = timed(
            query_as::<_, PostRow>(POSTS_BY_USER_SQL)
                .bind(user_id)
                .fetch_all(self.pool()),
        )
        .await?;

        Ok(rows.into_iter().map(Post::from).collect())
    }

    async fn insert_post(&self, author_id: UserId, body: &str) -> Result<Post, RepoError> {
        let row = timed(
            query_as::<_, PostRow>(INSERT_POST_SQL)
                .bind(author_id)
                .bind(body)
                .fetch_one(self.pool()),
        )
        .await?;

        Ok(Post::from(row))
    }

    async fn feed_for_user(&self, user_id: UserId) -> Result<Feed, RepoError> {
        let rows = timed(
            query_as::<_, PostRow>(FEED_FOR_USER_SQL)
                .bind(user_id)
                .bind(self.feed_limit)
                .fetch_all(self.pool()),
        )
        .await?;

        Ok(Feed::from_posts(rows.into_iter().map(Post::from).collect()))
    }
}
