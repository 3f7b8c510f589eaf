use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use super::cache::Cacheable;
use super::metrics::{EntryMetrics, MetricsSource};
use crate::storage::{Database, Entry};

pub const DEFAULT_PAGE_SIZE: i64 = 20;
pub const MAX_PAGE_SIZE: i64 = 100;

/// One page request over a set of feeds.
///
/// Construct through [`PageRequest::new`] or [`PageRequest::from_page`] so
/// the page size is clamped to `[1, MAX_PAGE_SIZE]` and the offset is never
/// negative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub feed_ids: Vec<i64>,
    pub offset: i64,
    pub page_size: i64,
    pub viewer: Option<String>,
}

impl PageRequest {
    pub fn new(feed_ids: Vec<i64>, offset: i64, page_size: i64) -> Self {
        let mut feed_ids = feed_ids;
        feed_ids.sort_unstable();
        feed_ids.dedup();
        Self {
            feed_ids,
            offset: offset.max(0),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            viewer: None,
        }
    }

    /// 1-based page number instead of an offset. Page 0 is treated as page 1.
    pub fn from_page(feed_ids: Vec<i64>, page: i64, page_size: i64) -> Self {
        let page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        let offset = (page.max(1) - 1).saturating_mul(page_size);
        Self::new(feed_ids, offset, page_size)
    }

    pub fn with_viewer(mut self, viewer: Option<String>) -> Self {
        self.viewer = viewer;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageEntry {
    pub entry: Entry,
    pub metrics: EntryMetrics,
}

/// A globally time-ordered slice of entries across feeds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergedPage {
    pub entries: Vec<PageEntry>,
    pub total_entries: i64,
    pub has_more: bool,
    pub offset: i64,
    pub page_size: i64,
    /// Set when the page is empty or partial because a dependency failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

impl MergedPage {
    pub(crate) fn degraded(request: &PageRequest, reason: impl Into<String>) -> Self {
        Self {
            entries: Vec::new(),
            total_entries: 0,
            has_more: false,
            offset: request.offset,
            page_size: request.page_size,
            degraded: Some(reason.into()),
        }
    }
}

impl Cacheable for MergedPage {
    fn is_cacheable(&self) -> bool {
        self.degraded.is_none()
    }
}

/// Newest entries of a single feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedListing {
    pub feed_id: i64,
    pub entries: Vec<Entry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

impl Cacheable for FeedListing {
    fn is_cacheable(&self) -> bool {
        self.degraded.is_none()
    }
}

/// Builds merged pages from the entry store and attaches metrics.
///
/// Reads never fail: a store error yields an empty page and a metrics error
/// yields zero metrics, both flagged through `degraded`.
#[derive(Clone)]
pub struct MergeEngine {
    db: Database,
    metrics: Arc<dyn MetricsSource>,
}

impl MergeEngine {
    pub fn new(db: Database, metrics: Arc<dyn MetricsSource>) -> Self {
        Self { db, metrics }
    }

    /// Merge, sort and slice entries of `request.feed_ids`.
    ///
    /// Order is `published DESC, id DESC`, computed by the store. `has_more`
    /// is true iff entries remain beyond this page.
    pub async fn page(&self, request: &PageRequest) -> MergedPage {
        if request.feed_ids.is_empty() {
            return MergedPage {
                entries: Vec::new(),
                total_entries: 0,
                has_more: false,
                offset: request.offset,
                page_size: request.page_size,
                degraded: None,
            };
        }

        let total = match self.db.count_entries(&request.feed_ids).await {
            Ok(total) => total,
            Err(e) => {
                tracing::warn!(error = %e, feeds = request.feed_ids.len(), "Entry count failed");
                return MergedPage::degraded(request, "entry store unavailable");
            }
        };

        let entries = match self
            .db
            .page_entries(&request.feed_ids, request.offset, request.page_size)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, offset = request.offset, "Entry page read failed");
                return MergedPage::degraded(request, "entry store unavailable");
            }
        };

        let returned = entries.len() as i64;
        let has_more = total > request.offset + returned;

        let guids: Vec<String> = entries.iter().map(|e| e.guid.clone()).collect();
        let (metrics, degraded) = match self
            .metrics
            .metrics_for(&guids, request.viewer.as_deref())
            .await
        {
            Ok(metrics) => (metrics, None),
            Err(e) => {
                tracing::warn!(error = %e, entries = guids.len(), "Metrics lookup failed, serving zero metrics");
                (HashMap::new(), Some("metrics unavailable".to_string()))
            }
        };

        let entries = entries
            .into_iter()
            .map(|entry| {
                let metrics = metrics.get(&entry.guid).copied().unwrap_or_default();
                PageEntry { entry, metrics }
            })
            .collect();

        MergedPage {
            entries,
            total_entries: total,
            has_more,
            offset: request.offset,
            page_size: request.page_size,
            degraded,
        }
    }

    /// Newest `limit` entries of one feed, `limit` clamped to `[1, MAX_PAGE_SIZE]`.
    pub async fn feed_entries(&self, feed_id: i64, limit: i64) -> FeedListing {
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        match self.db.entries_for_feed(feed_id, limit).await {
            Ok(entries) => FeedListing {
                feed_id,
                entries,
                degraded: None,
            },
            Err(e) => {
                tracing::warn!(feed_id = feed_id, error = %e, "Feed listing read failed");
                FeedListing {
                    feed_id,
                    entries: Vec::new(),
                    degraded: Some("entry store unavailable".to_string()),
                }
            }
        }
    }

    /// Map feed titles to ids. Unknown titles are dropped.
    pub async fn resolve_titles(&self, titles: &[String]) -> Result<Vec<i64>, crate::storage::DatabaseError> {
        let feeds = self.db.get_feeds_by_titles(titles).await?;
        Ok(feeds.into_iter().map(|f| f.id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ParsedEntry;
    use crate::stream::metrics::{MetricsError, NoMetrics};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    fn entry(guid: &str, published: i64) -> ParsedEntry {
        ParsedEntry {
            guid: guid.to_string(),
            title: format!("Title {guid}"),
            link: format!("https://example.com/{guid}"),
            description: None,
            published: Some(published),
            image: None,
            enclosure: None,
        }
    }

    async fn seeded() -> (Database, i64, i64) {
        let db = Database::open(":memory:").await.unwrap();
        let a = db
            .register_feed("https://a.example.com/rss", "A", None)
            .await
            .unwrap();
        let b = db
            .register_feed("https://b.example.com/rss", "B", None)
            .await
            .unwrap();
        db.insert_entries(a, &[entry("a3", 3), entry("a1", 1)], 10)
            .await
            .unwrap();
        db.insert_entries(b, &[entry("b2", 2)], 10).await.unwrap();
        (db, a, b)
    }

    fn guids(page: &MergedPage) -> Vec<&str> {
        page.entries.iter().map(|e| e.entry.guid.as_str()).collect()
    }

    #[test]
    fn test_page_request_clamps() {
        let req = PageRequest::new(vec![2, 1, 2], -5, 1000);
        assert_eq!(req.feed_ids, vec![1, 2]);
        assert_eq!(req.offset, 0);
        assert_eq!(req.page_size, MAX_PAGE_SIZE);

        assert_eq!(PageRequest::new(vec![1], 0, 0).page_size, 1);
        assert_eq!(PageRequest::from_page(vec![1], 3, 20).offset, 40);
        assert_eq!(PageRequest::from_page(vec![1], 0, 20).offset, 0);
    }

    #[tokio::test]
    async fn test_two_feed_scenario() {
        let (db, a, b) = seeded().await;
        let engine = MergeEngine::new(db, Arc::new(NoMetrics));

        let first = engine.page(&PageRequest::new(vec![a, b], 0, 2)).await;
        assert_eq!(guids(&first), vec!["a3", "b2"]);
        assert_eq!(first.total_entries, 3);
        assert!(first.has_more);

        let second = engine.page(&PageRequest::new(vec![a, b], 2, 2)).await;
        assert_eq!(guids(&second), vec!["a1"]);
        assert!(!second.has_more);
        assert!(second.degraded.is_none());
    }

    #[tokio::test]
    async fn test_offset_past_end() {
        let (db, a, b) = seeded().await;
        let engine = MergeEngine::new(db, Arc::new(NoMetrics));
        let page = engine.page(&PageRequest::new(vec![a, b], 10, 5)).await;
        assert!(page.entries.is_empty());
        assert_eq!(page.total_entries, 3);
        assert!(!page.has_more);
    }

    struct FailingMetrics;

    #[async_trait]
    impl MetricsSource for FailingMetrics {
        async fn metrics_for(
            &self,
            _guids: &[String],
            _viewer: Option<&str>,
        ) -> Result<HashMap<String, EntryMetrics>, MetricsError> {
            Err(MetricsError::Timeout)
        }
    }

    #[tokio::test]
    async fn test_metrics_failure_degrades() {
        let (db, a, _) = seeded().await;
        let engine = MergeEngine::new(db, Arc::new(FailingMetrics));
        let page = engine.page(&PageRequest::new(vec![a], 0, 10)).await;

        assert_eq!(guids(&page), vec!["a3", "a1"]);
        assert!(page.entries.iter().all(|e| e.metrics == EntryMetrics::default()));
        assert_eq!(page.degraded.as_deref(), Some("metrics unavailable"));
        assert!(!page.is_cacheable());
    }

    #[tokio::test]
    async fn test_store_failure_degrades_to_empty_page() {
        let (db, a, _) = seeded().await;
        db.pool.close().await;
        let engine = MergeEngine::new(db, Arc::new(NoMetrics));
        let page = engine.page(&PageRequest::new(vec![a], 0, 10)).await;

        assert!(page.entries.is_empty());
        assert!(!page.has_more);
        assert!(page.degraded.is_some());
    }

    #[tokio::test]
    async fn test_feed_entries_and_titles() {
        let (db, a, b) = seeded().await;
        let engine = MergeEngine::new(db, Arc::new(NoMetrics));

        let listing = engine.feed_entries(a, 10).await;
        let listed: Vec<_> = listing.entries.iter().map(|e| e.guid.as_str()).collect();
        assert_eq!(listed, vec!["a3", "a1"]);

        let ids = engine
            .resolve_titles(&["B".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(ids, vec![b]);
    }
}
