use async_trait::async_trait;
use sqlx::query_as;

use crate::application::repos::{RepoError, UserStore};
use crate::domain::posts::Author;
use crate::domain::types::UserId;

use super::rows::AuthorRow;
use super::{PostgresRepositories, timed};

const AUTHOR_BY_LOGIN_SQL: &str = r#"
    SELECT u.id AS author_id, u.first_name, u.last_name, u.login
    FROM users u
    WHERE u.login = $1
"#;

const FRIENDS_SQL: &str = r#"
    SELECT u.id AS author_id, u.first_name, u.last_name, u.login
    FROM friends f
    JOIN users u ON u.id = f.friend_id
    WHERE f.user_id = $1
    ORDER BY u.id
"#;

#[async_trait]
impl UserStore for PostgresRepositories {
    async fn author_by_login(&self, login: &str) -> Result<Option<Author>, RepoError> {
        let row = timed(
            query_as::<_, AuthorRow>(AUTHOR_BY_LOGIN_SQL)
                .bind(login)
                .fetch_optional(self.pool()),
        )
        .await?;

        Ok(row.map(Author::from))
    }

    async fn friends(&self, user_id: UserId) -> Result<Vec<Author>, RepoError> {
        let rows = timed(
            query_as::<_, AuthorRow>(FRIENDS_SQL)
                .bind(user_id)
                .fetch_all(self.pool()),
        )
        .await?;

        Ok(rows.into_iter().map(Author::from).collect())
    }
}
