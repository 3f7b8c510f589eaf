use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::message::{RefreshBatch, RefreshNotification, WorkItem};
use super::queue::BatchHandler;
use super::worker::{BatchReport, RefreshWorker};
use crate::feed::{is_quarantined, is_stale};
use crate::storage::{Database, DatabaseError, Feed};
use crate::stream::ReadCache;
use crate::util::{unix_now, validate_url};

/// Failures that make a whole batch unprocessable. The transport redelivers.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Feed store unavailable: {0}")]
    Store(#[from] DatabaseError),
}

/// Posts refresh notifications to a callback URL. Best effort: failures are
/// logged, never propagated.
#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl Notifier {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            timeout: Duration::from_secs(10),
        }
    }

    pub async fn send(&self, notification: &RefreshNotification) {
        let request = self.client.post(&self.url).json(notification).send();
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(response)) if response.status().is_success() => {}
            Ok(Ok(response)) => tracing::warn!(
                batch_id = %notification.batch_id,
                status = %response.status(),
                "Refresh notification rejected"
            ),
            Ok(Err(e)) => tracing::warn!(
                batch_id = %notification.batch_id,
                error = %e,
                "Refresh notification failed"
            ),
            Err(_) => tracing::warn!(
                batch_id = %notification.batch_id,
                "Refresh notification timed out"
            ),
        }
    }
}

/// Turns delivered batches into worker runs.
pub struct Dispatcher {
    db: Database,
    worker: RefreshWorker,
    cache: Arc<ReadCache>,
    notifier: Option<Notifier>,
    allow_private_networks: bool,
}

impl Dispatcher {
    pub fn new(db: Database, worker: RefreshWorker, cache: Arc<ReadCache>) -> Self {
        Self {
            db,
            worker,
            cache,
            notifier: None,
            allow_private_networks: false,
        }
    }

    pub fn with_notifier(mut self, notifier: Option<Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn allow_private_networks(mut self, allow: bool) -> Self {
        self.allow_private_networks = allow;
        self
    }

    /// Process one batch.
    ///
    /// Invalid items are skipped with a warning and per-feed refresh failures
    /// are folded into the notification. Only store failures return `Err`.
    pub async fn handle(&self, batch: &RefreshBatch) -> Result<RefreshNotification, PipelineError> {
        let mut feeds: Vec<Feed> = Vec::with_capacity(batch.feeds.len());
        let mut seen = HashSet::new();
        for item in &batch.feeds {
            if let Some(feed) = self.resolve(item).await? {
                if seen.insert(feed.id) {
                    feeds.push(feed);
                }
            }
        }

        let feed_ids: Vec<i64> = feeds.iter().map(|f| f.id).collect();
        let post_titles: Vec<String> = feeds.iter().map(|f| f.title.to_string()).collect();
        let known: HashSet<String> = batch.existing_guids.iter().cloned().collect();

        let report = self.worker.refresh_batch(feeds, &known).await.into_result()?;

        self.cache.invalidate_feeds(&report.refreshed_feed_ids());
        let total_entries = self.db.count_entries(&feed_ids).await?;

        let notification = RefreshNotification {
            batch_id: batch.batch_id.clone(),
            success: report.failures() == 0,
            refreshed_any: report.refreshed_any(),
            new_entries_count: report.new_entries(),
            total_entries,
            post_titles,
            refresh_timestamp: chrono::Utc::now().to_rfc3339(),
        };

        tracing::info!(
            batch_id = %batch.batch_id,
            feeds = feed_ids.len(),
            new_entries = notification.new_entries_count,
            failures = report.failures(),
            "Refresh batch handled"
        );

        if let Some(notifier) = &self.notifier {
            notifier.send(&notification).await;
        }
        Ok(notification)
    }

    /// Find the feed a work item refers to, registering it on first sight.
    /// Returns `None` for items that can never succeed (bad URL).
    async fn resolve(&self, item: &WorkItem) -> Result<Option<Feed>, PipelineError> {
        if let Some(id) = item.feed_id {
            if let Some(feed) = self.db.get_feed(id).await? {
                return Ok(Some(feed));
            }
        }

        let url = match validate_url(&item.feed_url, self.allow_private_networks) {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(feed_url = %item.feed_url, error = %e, "Rejected work item");
                return Ok(None);
            }
        };
        let url = url.as_str();

        let title = item.post_title.trim();
        if title.is_empty() {
            if let Some(feed) = self.db.get_feed_by_url(url).await? {
                return Ok(Some(feed));
            }
        }
        let title = if title.is_empty() { url } else { title };

        let id = self
            .db
            .register_feed(url, title, item.media_type.as_deref())
            .await?;
        Ok(self.db.get_feed(id).await?)
    }

    /// Titles that need a refresh, in request order. A title with no known
    /// feed counts as stale; a quarantined feed does not.
    pub async fn stale_titles(&self, titles: &[String]) -> Result<Vec<String>, PipelineError> {
        let now = unix_now();
        let window = self.worker.settings().freshness_window;
        let feeds = self.db.get_feeds_by_titles(titles).await?;

        let mut seen = HashSet::new();
        let stale = titles
            .iter()
            .filter(|title| seen.insert(title.as_str()))
            .filter(|title| {
                let mut matching = feeds.iter().filter(|f| &*f.title == title.as_str()).peekable();
                matching.peek().is_none()
                    || matching.any(|f| is_stale(f, now, window) && !is_quarantined(f, now, window))
            })
            .cloned()
            .collect();
        Ok(stale)
    }

    /// One pass over every stale feed in the store.
    pub async fn refresh_stale(&self) -> Result<BatchReport, PipelineError> {
        let window = i64::try_from(self.worker.settings().freshness_window.as_secs())
            .unwrap_or(i64::MAX);
        let feeds = self.db.stale_feeds(unix_now(), window).await?;
        let report = self
            .worker
            .refresh_batch(feeds, &HashSet::new())
            .await
            .into_result()?;
        self.cache.invalidate_feeds(&report.refreshed_feed_ids());
        Ok(report)
    }
}

#[async_trait]
impl BatchHandler for Dispatcher {
    async fn handle(&self, batch: &RefreshBatch) -> Result<RefreshNotification, PipelineError> {
        Dispatcher::handle(self, batch).await
    }
}
