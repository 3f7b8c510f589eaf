//! Read side: merged, paginated streams across feeds with metrics attached,
//! and the short-lived cache in front of them.

mod cache;
mod merge;
mod metrics;

use std::time::Duration;

pub use cache::{CacheKey, CacheStats, Cacheable, ResponseCache};
pub use merge::{
    FeedListing, MergeEngine, MergedPage, PageEntry, PageRequest, DEFAULT_PAGE_SIZE,
    MAX_PAGE_SIZE,
};
pub use metrics::{EntryMetrics, HttpMetrics, MetricsError, MetricsSource, NoMetrics};

/// Caches for the two read paths, invalidated together.
pub struct ReadCache {
    pub pages: ResponseCache<MergedPage>,
    pub listings: ResponseCache<FeedListing>,
    pub ttl: Duration,
}

impl ReadCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            pages: ResponseCache::new(capacity),
            listings: ResponseCache::new(capacity),
            ttl,
        }
    }

    /// Drop cached pages and listings involving any of `feed_ids`
    pub fn invalidate_feeds(&self, feed_ids: &[i64]) -> usize {
        self.pages.invalidate_feeds(feed_ids) + self.listings.invalidate_feeds(feed_ids)
    }

    pub fn invalidate_all(&self) {
        self.pages.invalidate_all();
        self.listings.invalidate_all();
    }
}
