//! Supervised background population of the feed cache.
//!
//! The read path hands freshly loaded feeds to the warmer instead of writing
//! them inline, so a cache miss never waits on the cache write. A loaded
//! feed is only stored while the user has no entry; a consumer refresh that
//! got there first wins. The warmer
//! owns one task; its failures are logged, its backlog is bounded, and it is
//! drained and joined on shutdown.

use std::sync::{Arc, Mutex};

use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::posts::Feed;
use crate::domain::types::UserId;

use crate::util::lock::mutex_lock;

use super::config::CacheConfig;
use super::store::FeedCache;

const SOURCE: &str = "cache::warmer";
const METRIC_WARM_SKIPPED: &str = "murmur_feed_warm_skipped_total";

enum WarmCommand {
    Populate { user_id: UserId, feed: Feed },
    Flush(oneshot::Sender<()>),
    Stop,
}

pub struct CacheWarmer {
    tx: mpsc::Sender<WarmCommand>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CacheWarmer {
    /// Start the warmer task. Must be called from within a Tokio runtime.
    pub fn spawn(cache: Arc<FeedCache>, config: &CacheConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.warm_queue_limit_non_zero().get());
        let handle = tokio::spawn(run(cache, rx));
        Self {
            tx,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Queue a cache write without waiting for it.
    ///
    /// When the backlog is full the population is skipped; the next read
    /// misses again and retries.
    pub fn populate(&self, user_id: UserId, feed: Feed) {
        match self.tx.try_send(WarmCommand::Populate { user_id, feed }) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!(METRIC_WARM_SKIPPED, "reason" => "backlog_full").increment(1);
                warn!(user_id, "Feed cache population skipped: warmer backlog full");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                counter!(METRIC_WARM_SKIPPED, "reason" => "stopped").increment(1);
                warn!(user_id, "Feed cache population skipped: warmer stopped");
            }
        }
    }

    /// Wait until every population queued before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WarmCommand::Flush(done_tx)).await.is_err() {
            return;
        }
        let _ = done_rx.await;
    }

    /// Apply the remaining backlog, stop the task, and report how it ended.
    pub async fn shutdown(&self) {
        let handle = mutex_lock(&self.handle, SOURCE, "shutdown").take();
        let Some(handle) = handle else {
            return;
        };

        let _ = self.tx.send(WarmCommand::Stop).await;
        match handle.await {
            Ok(()) => info!("Feed cache warmer stopped"),
            Err(err) if err.is_panic() => error!(error = %err, "Feed cache warmer panicked"),
            Err(err) => warn!(error = %err, "Feed cache warmer cancelled"),
        }
    }
}

async fn run(cache: Arc<FeedCache>, mut rx: mpsc::Receiver<WarmCommand>) {
    while let Some(command) = rx.recv().await {
        match command {
            WarmCommand::Populate { user_id, feed } => {
                let posts = feed.len();
                if cache.write_if_absent(user_id, feed) {
                    debug!(user_id, posts, "Feed cache populated");
                } else {
                    counter!(METRIC_WARM_SKIPPED, "reason" => "refreshed").increment(1);
                    debug!(user_id, "Feed already refreshed; loaded copy discarded");
                }
            }
            WarmCommand::Flush(done) => {
                let _ = done.send(());
            }
            WarmCommand::Stop => break,
        }
    }
}
