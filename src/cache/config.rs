//! Feed cache sizing.

use std::num::NonZeroUsize;

const DEFAULT_CAPACITY: usize = 10_000;
const DEFAULT_WARM_QUEUE_LIMIT: usize = 1024;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of users whose feeds are kept in memory.
    pub capacity: usize,
    /// Maximum pending background populations before new ones are skipped.
    pub warm_queue_limit: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            warm_queue_limit: DEFAULT_WARM_QUEUE_LIMIT,
        }
    }
}

impl From<&crate::config::FeedSettings> for CacheConfig {
    fn from(settings: &crate::config::FeedSettings) -> Self {
        Self {
            capacity: settings.cache_capacity.get(),
            warm_queue_limit: settings.warm_queue_limit.get(),
        }
    }
}

impl CacheConfig {
    /// Capacity as `NonZeroUsize`, clamping zero to one.
    pub fn capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.capacity).unwrap_or(NonZeroUsize::MIN)
    }

    pub fn warm_queue_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.warm_queue_limit).unwrap_or(NonZeroUsize::MIN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.capacity, 10_000);
        assert_eq!(config.warm_queue_limit, 1024);
    }

    #[test]
    fn non_zero_clamps_to_min() {
        let config = CacheConfig {
            capacity: 0,
            warm_queue_limit: 0,
        };
        assert_eq!(config.capacity_non_zero().get(), 1);
        assert_eq!(config.warm_queue_limit_non_zero().get(), 1);
    }
}
