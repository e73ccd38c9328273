use time::OffsetDateTime;

use crate::domain::posts::{Author, Post};

#[derive(sqlx::FromRow)]
pub(crate) struct PostRow {
    pub(crate) id: i64,
    pub(crate) created_at: OffsetDateTime,
    pub(crate) updated_at: OffsetDateTime,
    pub(crate) body: String,
    pub(crate) author_id: i64,
    pub(crate) first_name: String,
    pub(crate) last_name: String,
    pub(crate) login: String,
}

impl From<PostRow> for Post {
    fn from(row: PostRow) -> Self {
        Self {
            id: row.id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            body: row.body,
            author: Author {
                id: row.author_id,
                first_name: row.first_name,
                last_name: row.last_name,
                login: row.login,
            },
        }
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct AuthorRow {
    pub(crate) author_id: i64,
    pub(crate) first_name: String,
    pub(crate) last_name: String,
    pub(crate) login: String,
}

impl From<AuthorRow> for Author {
    fn from(row: AuthorRow) -> Self {
        Self {
            id: row.author_id,
            first_name: row.first_name,
            last_name: row.last_name,
            login: row.login,
        }
    }
}
