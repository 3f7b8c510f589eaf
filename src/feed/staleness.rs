use std::time::Duration;

use crate::storage::{Database, Feed};

/// Whether a feed is due for a refresh.
///
/// Stale when it has never been refreshed successfully, or when at least
/// `window` has passed since the last successful refresh.
pub fn is_stale(feed: &Feed, now: i64, window: Duration) -> bool {
    match feed.last_fetched {
        None => true,
        Some(last) => now.saturating_sub(last) >= window_secs(window),
    }
}

/// Whether a repeatedly failing feed is still backing off.
///
/// After [`Database::QUARANTINE_THRESHOLD`] consecutive failures the feed is
/// only retried once per `window`, counted from the last failed attempt, so a
/// permanently broken source does not get refetched on every dispatch.
pub fn is_quarantined(feed: &Feed, now: i64, window: Duration) -> bool {
    if feed.consecutive_failures < Database::QUARANTINE_THRESHOLD {
        return false;
    }
    match feed.last_attempted {
        None => false,
        Some(last) => now.saturating_sub(last) < window_secs(window),
    }
}

fn window_secs(window: Duration) -> i64 {
    i64::try_from(window.as_secs()).unwrap_or(i64::MAX)
}
