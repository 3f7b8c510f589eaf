use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::message::{RefreshBatch, WorkItem};
use super::queue::QueueTransport;
use crate::storage::{Database, DatabaseError};
use crate::util::unix_now;

/// Build one batch covering every feed that is stale right now, or `None`
/// when nothing is due.
pub async fn stale_batch(db: &Database, window: Duration) -> Result<Option<RefreshBatch>, DatabaseError> {
    let now = unix_now();
    let window_secs = i64::try_from(window.as_secs()).unwrap_or(i64::MAX);
    let feeds = db.stale_feeds(now, window_secs).await?;
    if feeds.is_empty() {
        return Ok(None);
    }

    let feeds = feeds
        .into_iter()
        .map(|f| WorkItem {
            feed_id: Some(f.id),
            post_title: f.title.to_string(),
            feed_url: f.url,
            media_type: f.media_type,
        })
        .collect();
    Ok(Some(RefreshBatch {
        batch_id: format!("scheduled-{now}"),
        feeds,
        existing_guids: Vec::new(),
    }))
}

/// Publish a batch of stale feeds every `interval` until shutdown.
pub async fn run_scheduler(
    db: Database,
    queue: Arc<dyn QueueTransport>,
    interval: Duration,
    window: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        match stale_batch(&db, window).await {
            Ok(Some(batch)) => {
                let feeds = batch.feeds.len();
                let batch_id = batch.batch_id.clone();
                match queue.publish(batch).await {
                    Ok(()) => tracing::info!(batch_id = %batch_id, feeds, "Scheduled refresh published"),
                    Err(e) => tracing::warn!(batch_id = %batch_id, error = %e, "Scheduled refresh not published"),
                }
            }
            Ok(None) => tracing::debug!("No stale feeds"),
            Err(e) => tracing::warn!(error = %e, "Stale feed scan failed"),
        }
    }
    tracing::debug!("Scheduler stopped");
}
