use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::feed::{
    fetch_feed, is_quarantined, is_stale, parse_document, FetchError, ParseError,
    DEFAULT_MAX_ENTRIES, MAX_FEED_SIZE,
};
use crate::storage::{Database, DatabaseError, Feed, RefreshLease, RefreshStatus};
use crate::util::unix_now;

/// Tunables for a refresh worker.
#[derive(Debug, Clone)]
pub struct RefreshSettings {
    pub freshness_window: Duration,
    pub lock_ttl: Duration,
    pub fetch_timeout: Duration,
    /// Feeds refreshed in parallel within one batch
    pub concurrency: usize,
    pub max_entries: usize,
    pub max_bytes: usize,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(4 * 3600),
            lock_ttl: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(30),
            concurrency: 15,
            max_entries: DEFAULT_MAX_ENTRIES,
            max_bytes: MAX_FEED_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Refreshed within the freshness window
    Fresh,
    /// Another worker holds the refresh lock
    Locked,
    /// Failing repeatedly and still backing off
    Quarantined,
}

/// Result of a refresh that did not error. Contention is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed { new_entries: usize },
    Skipped(SkipReason),
}

impl RefreshOutcome {
    pub fn refreshed(&self) -> bool {
        matches!(self, RefreshOutcome::Refreshed { .. })
    }

    pub fn new_entries(&self) -> usize {
        match self {
            RefreshOutcome::Refreshed { new_entries } => *new_entries,
            RefreshOutcome::Skipped(_) => 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    /// Unreachable host, non-2xx, timeout, oversized body
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// Body was not a readable feed
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// Entry or feed store failed
    #[error(transparent)]
    Store(#[from] DatabaseError),
}

impl RefreshError {
    /// Store failures abort the batch and trigger redelivery. Everything
    /// else is a per-feed failure that the next dispatch retries.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RefreshError::Store(_))
    }
}

#[derive(Debug)]
pub struct FeedReport {
    pub feed_id: i64,
    pub title: Arc<str>,
    pub result: Result<RefreshOutcome, RefreshError>,
}

/// Collected per-feed results of one batch, in completion order.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub feeds: Vec<FeedReport>,
}

impl BatchReport {
    pub fn refreshed_any(&self) -> bool {
        self.feeds
            .iter()
            .any(|r| matches!(&r.result, Ok(outcome) if outcome.refreshed()))
    }

    pub fn new_entries(&self) -> usize {
        self.feeds
            .iter()
            .filter_map(|r| r.result.as_ref().ok())
            .map(RefreshOutcome::new_entries)
            .sum()
    }

    pub fn refreshed_feed_ids(&self) -> Vec<i64> {
        self.feeds
            .iter()
            .filter(|r| matches!(&r.result, Ok(outcome) if outcome.refreshed()))
            .map(|r| r.feed_id)
            .collect()
    }

    pub fn failures(&self) -> usize {
        self.feeds.iter().filter(|r| r.result.is_err()).count()
    }

    /// Fail the whole batch if any feed hit a store failure
    pub fn into_result(mut self) -> Result<Self, DatabaseError> {
        let fatal = self
            .feeds
            .iter()
            .position(|r| matches!(r.result, Err(RefreshError::Store(_))));
        match fatal.map(|i| self.feeds.swap_remove(i).result) {
            Some(Err(RefreshError::Store(e))) => Err(e),
            _ => Ok(self),
        }
    }
}

/// Runs the check → lock → fetch → parse → write → release sequence.
#[derive(Clone)]
pub struct RefreshWorker {
    db: Database,
    client: reqwest::Client,
    settings: RefreshSettings,
}

impl RefreshWorker {
    pub fn new(db: Database, client: reqwest::Client, settings: RefreshSettings) -> Self {
        Self {
            db,
            client,
            settings,
        }
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.settings
    }

    /// Refresh one feed if it is stale and nobody else is refreshing it.
    ///
    /// Entries whose GUID is in `known_guids` are dropped before writing.
    /// Every acquired lock is released on every path: success credits
    /// freshness, any failure releases without it.
    pub async fn refresh(
        &self,
        feed: &Feed,
        known_guids: &HashSet<String>,
    ) -> Result<RefreshOutcome, RefreshError> {
        let now = unix_now();
        let window = self.settings.freshness_window;

        if !is_stale(feed, now, window) {
            tracing::debug!(feed_id = feed.id, "Feed is fresh, skipping");
            return Ok(RefreshOutcome::Skipped(SkipReason::Fresh));
        }
        if is_quarantined(feed, now, window) {
            tracing::debug!(
                feed_id = feed.id,
                failures = feed.consecutive_failures,
                "Feed quarantined after repeated failures, skipping"
            );
            return Ok(RefreshOutcome::Skipped(SkipReason::Quarantined));
        }

        let ttl = i64::try_from(self.settings.lock_ttl.as_secs()).unwrap_or(i64::MAX);
        let window_secs = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
        let Some(lease) = self
            .db
            .try_acquire_stale_refresh_lock(feed.id, now, ttl, window_secs)
            .await?
        else {
            // `feed` may predate a refresh that finished since
            let fresh = match self.db.get_feed(feed.id).await? {
                Some(current) => !is_stale(&current, now, window),
                None => false,
            };
            if fresh {
                tracing::debug!(feed_id = feed.id, "Feed refreshed elsewhere meanwhile, skipping");
                return Ok(RefreshOutcome::Skipped(SkipReason::Fresh));
            }
            tracing::debug!(feed_id = feed.id, "Refresh lock held elsewhere, skipping");
            return Ok(RefreshOutcome::Skipped(SkipReason::Locked));
        };

        match self.fetch_and_store(feed, known_guids).await {
            Ok(new_entries) => {
                self.db
                    .release_refresh_lock(lease, RefreshStatus::Succeeded, unix_now())
                    .await?;
                if new_entries > 0 {
                    tracing::info!(feed_id = feed.id, title = %feed.title, new_entries, "Feed refreshed");
                } else {
                    tracing::debug!(feed_id = feed.id, "Feed refreshed, nothing new");
                }
                Ok(RefreshOutcome::Refreshed { new_entries })
            }
            Err(e) => {
                tracing::warn!(feed_id = feed.id, url = %feed.url, error = %e, "Feed refresh failed");
                self.release_failed(lease, &e).await?;
                Err(e)
            }
        }
    }

    async fn fetch_and_store(
        &self,
        feed: &Feed,
        known_guids: &HashSet<String>,
    ) -> Result<usize, RefreshError> {
        let bytes = fetch_feed(
            &self.client,
            &feed.url,
            self.settings.fetch_timeout,
            self.settings.max_bytes,
        )
        .await?;

        let outcome = parse_document(&bytes, self.settings.max_entries)?;
        if outcome.skipped > 0 || outcome.recovered {
            tracing::debug!(
                feed_id = feed.id,
                skipped = outcome.skipped,
                recovered = outcome.recovered,
                "Feed document partially readable"
            );
        }

        let mut entries = outcome.entries;
        entries.retain(|e| !known_guids.contains(&e.guid));

        let inserted = self.db.insert_entries(feed.id, &entries, unix_now()).await?;
        Ok(inserted)
    }

    /// Release after a failed refresh. A store failure during the release is
    /// reported in place of the original error when the original was not
    /// itself a store failure; the lock then self-expires.
    async fn release_failed(&self, lease: RefreshLease, error: &RefreshError) -> Result<(), RefreshError> {
        let message = error.to_string();
        match self
            .db
            .release_refresh_lock(lease, RefreshStatus::Failed(&message), unix_now())
            .await
        {
            Ok(_) => Ok(()),
            Err(release_err) if !error.is_fatal() => Err(release_err.into()),
            Err(release_err) => {
                tracing::warn!(
                    feed_id = lease.feed_id,
                    error = %release_err,
                    "Could not release refresh lock; it will expire on its own"
                );
                Ok(())
            }
        }
    }

    /// Refresh many feeds with bounded parallelism. Per-feed failures are
    /// collected, never propagated.
    pub async fn refresh_batch(&self, feeds: Vec<Feed>, known_guids: &HashSet<String>) -> BatchReport {
        if feeds.is_empty() {
            return BatchReport::default();
        }

        let concurrency = self.settings.concurrency.max(1);
        let reports: Vec<FeedReport> = stream::iter(feeds)
            .map(|feed| async move {
                let result = self.refresh(&feed, known_guids).await;
                FeedReport {
                    feed_id: feed.id,
                    title: Arc::clone(&feed.title),
                    result,
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        BatchReport { feeds: reports }
    }
}
