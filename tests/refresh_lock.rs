//! Integration tests for the per-feed refresh lock.
//!
//! Mutual exclusion is checked against an on-disk database opened through
//! two independent pools, the closest local stand-in for separate worker
//! processes sharing one store.

use feedsync::feed::{is_quarantined, is_stale};
use feedsync::storage::{Database, RefreshStatus};
use std::time::Duration;

const T0: i64 = 1_700_000_000;
const TTL: i64 = 300;
const WINDOW: Duration = Duration::from_secs(4 * 3600);

async fn on_disk() -> (tempfile::TempDir, Database, Database) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("feeds.db");
    let path = path.to_str().unwrap();
    let first = Database::open(path).await.unwrap();
    let second = Database::open(path).await.unwrap();
    (dir, first, second)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquire_has_one_winner() {
    let (_dir, a, b) = on_disk().await;
    let feed_id = a
        .register_feed("https://feed.example.com/rss", "Contended", None)
        .await
        .unwrap();

    let mut handles = Vec::new();
    for i in 0..16 {
        let db = if i % 2 == 0 { a.clone() } else { b.clone() };
        handles.push(tokio::spawn(async move {
            db.try_acquire_refresh_lock(feed_id, T0, TTL).await.unwrap()
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(lease) = handle.await.unwrap() {
            winners.push(lease);
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].expires_at, T0 + TTL);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_locks_are_per_feed() {
    let (_dir, a, b) = on_disk().await;
    let first = a
        .register_feed("https://one.example.com/rss", "One", None)
        .await
        .unwrap();
    let second = a
        .register_feed("https://two.example.com/rss", "Two", None)
        .await
        .unwrap();

    let (x, y) = tokio::join!(
        a.try_acquire_refresh_lock(first, T0, TTL),
        b.try_acquire_refresh_lock(second, T0, TTL),
    );
    assert!(x.unwrap().is_some());
    assert!(y.unwrap().is_some());
}

#[tokio::test]
async fn test_abandoned_lock_self_heals() {
    let (_dir, a, b) = on_disk().await;
    let feed_id = a
        .register_feed("https://feed.example.com/rss", "Crashy", None)
        .await
        .unwrap();

    // Worker on `a` claims and crashes without releasing
    let abandoned = a.try_acquire_refresh_lock(feed_id, T0, TTL).await.unwrap().unwrap();

    assert!(b.try_acquire_refresh_lock(feed_id, T0 + TTL, TTL).await.unwrap().is_none());
    let rescued = b
        .try_acquire_refresh_lock(feed_id, T0 + TTL + 1, TTL)
        .await
        .unwrap()
        .expect("expired lock must be claimable");

    // The late release of the abandoned lease leaves the new owner alone
    let owned = a
        .release_refresh_lock(abandoned, RefreshStatus::Failed("crashed"), T0 + TTL + 2)
        .await
        .unwrap();
    assert!(!owned);
    assert!(b.try_acquire_refresh_lock(feed_id, T0 + TTL + 3, TTL).await.unwrap().is_none());

    assert!(b
        .release_refresh_lock(rescued, RefreshStatus::Succeeded, T0 + TTL + 4)
        .await
        .unwrap());
    let feed = a.get_feed(feed_id).await.unwrap().unwrap();
    assert_eq!(feed.lock_until, None);
    assert_eq!(feed.last_fetched, Some(T0 + TTL + 4));
    assert_eq!(feed.consecutive_failures, 0);
}

#[tokio::test]
async fn test_failed_release_keeps_feed_stale() {
    let db = Database::open(":memory:").await.unwrap();
    let feed_id = db
        .register_feed("https://feed.example.com/rss", "Broken", None)
        .await
        .unwrap();

    let lease = db.try_acquire_refresh_lock(feed_id, T0, TTL).await.unwrap().unwrap();
    db.release_refresh_lock(lease, RefreshStatus::Failed("HTTP 500"), T0 + 1)
        .await
        .unwrap();

    let feed = db.get_feed(feed_id).await.unwrap().unwrap();
    assert!(is_stale(&feed, T0 + 2, WINDOW));
    assert_eq!(feed.consecutive_failures, 1);
    assert_eq!(feed.error.as_deref(), Some("HTTP 500"));
    assert!(db.try_acquire_refresh_lock(feed_id, T0 + 2, TTL).await.unwrap().is_some());
}

#[tokio::test]
async fn test_repeated_failures_quarantine_until_window_passes() {
    let db = Database::open(":memory:").await.unwrap();
    let feed_id = db
        .register_feed("https://feed.example.com/rss", "Dead", None)
        .await
        .unwrap();

    let mut now = T0;
    for _ in 0..Database::QUARANTINE_THRESHOLD {
        let lease = db.try_acquire_refresh_lock(feed_id, now, TTL).await.unwrap().unwrap();
        db.release_refresh_lock(lease, RefreshStatus::Failed("timeout"), now)
            .await
            .unwrap();
        now += 1;
    }

    let feed = db.get_feed(feed_id).await.unwrap().unwrap();
    let last = feed.last_attempted.unwrap();
    let window = WINDOW.as_secs() as i64;
    assert!(is_quarantined(&feed, last + window - 1, WINDOW));
    assert!(!is_quarantined(&feed, last + window, WINDOW));

    // One success clears the quarantine
    let lease = db.try_acquire_refresh_lock(feed_id, now, TTL).await.unwrap().unwrap();
    db.release_refresh_lock(lease, RefreshStatus::Succeeded, now)
        .await
        .unwrap();
    let feed = db.get_feed(feed_id).await.unwrap().unwrap();
    assert!(!is_quarantined(&feed, now, WINDOW));
}
