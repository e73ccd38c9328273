//! Application services: the feed read path and the post write path.

pub mod error;
pub mod feed;
pub mod posts;
pub mod repos;
