//! Postgres-backed store implementations.
//!
//! Works against an existing `users`, `friends` and `posts` schema with
//! `BIGINT` ids and `TIMESTAMPTZ` timestamps. Friendship rows are stored in
//! both directions.

mod posts;
mod rows;
mod users;
mod util;

pub use util::map_sqlx_error;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::application::repos::RepoError;
use crate::domain::posts::DEFAULT_FEED_LENGTH_CAP;

const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct PostgresRepositories {
    pool: Arc<PgPool>,
    feed_limit: i64,
}

impl PostgresRepositories {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
            feed_limit: DEFAULT_FEED_LENGTH_CAP as i64,
        }
    }

    /// Bound the number of posts loaded per feed recompute.
    pub fn with_feed_limit(mut self, limit: usize) -> Self {
        self.feed_limit = i64::try_from(limit).unwrap_or(i64::MAX).max(1);
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }
}

/// Run `query` with the per-statement timeout, mapping failures to [`RepoError`].
async fn timed<T>(
    query: impl Future<Output = Result<T, sqlx::Error>>,
) -> Result<T, RepoError> {
    match tokio::time::timeout(QUERY_TIMEOUT, query).await {
        Ok(result) => result.map_err(map_sqlx_error),
        Err(_) => Err(RepoError::Timeout),
    }
}
