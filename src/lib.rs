//! Feed-update distribution for a social network.
//!
//! A new post is persisted, announced on a durable broker queue, and picked
//! up by a pool of consumers that recompute the feeds of the author and the
//! author's friends, store them in [`cache::FeedCache`] and push a
//! notification to any live connection of those users.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
pub mod queue;
pub mod realtime;

pub(crate) mod util;
