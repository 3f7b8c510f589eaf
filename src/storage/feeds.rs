use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{DatabaseError, Feed, FeedRow, RefreshLease, RefreshStatus};

const FEED_COLUMNS: &str = "id, title, url, media_type, last_fetched, lock_until, \
     last_attempted, consecutive_failures, error";

impl Database {
    // ========================================================================
    // Feed Registry
    // ========================================================================

    /// Register a feed by URL, returning its ID.
    ///
    /// A feed is created on first reference. Re-registering an existing URL
    /// refreshes the title (and media type when one is given) but never
    /// touches refresh bookkeeping.
    pub async fn register_feed(
        &self,
        url: &str,
        title: &str,
        media_type: Option<&str>,
    ) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (title, url, media_type) VALUES (?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                title = excluded.title,
                media_type = COALESCE(excluded.media_type, feeds.media_type)
            RETURNING id
        "#,
        )
        .bind(title)
        .bind(url)
        .bind(media_type)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    pub async fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>, DatabaseError> {
        let row = sqlx::query_as::<_, FeedRow>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE id = ?"
        ))
        .bind(feed_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(FeedRow::into_feed))
    }

    pub async fn get_feed_by_url(&self, url: &str) -> Result<Option<Feed>, DatabaseError> {
        let row = sqlx::query_as::<_, FeedRow>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE url = ?"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(FeedRow::into_feed))
    }

    /// Look up feeds by title. Titles with no matching feed are simply absent
    /// from the result.
    pub async fn get_feeds_by_titles(&self, titles: &[String]) -> Result<Vec<Feed>, DatabaseError> {
        if titles.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {FEED_COLUMNS} FROM feeds WHERE title IN ("));
        let mut separated = builder.separated(", ");
        for title in titles {
            separated.push_bind(title);
        }
        separated.push_unseparated(") ORDER BY id");

        let rows: Vec<FeedRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(FeedRow::into_feed).collect())
    }

    pub async fn get_feeds_by_ids(&self, ids: &[i64]) -> Result<Vec<Feed>, DatabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new(format!("SELECT {FEED_COLUMNS} FROM feeds WHERE id IN ("));
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY id");

        let rows: Vec<FeedRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(FeedRow::into_feed).collect())
    }

    pub async fn list_feeds(&self) -> Result<Vec<Feed>, DatabaseError> {
        let rows = sqlx::query_as::<_, FeedRow>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds ORDER BY title, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedRow::into_feed).collect())
    }

    /// Feeds whose last successful refresh is at least `window_secs` old, or
    /// that have never been refreshed, minus quarantined ones. Mirrors
    /// `feed::staleness::{is_stale, is_quarantined}`.
    pub async fn stale_feeds(&self, now: i64, window_secs: i64) -> Result<Vec<Feed>, DatabaseError> {
        let cutoff = now.saturating_sub(window_secs);
        let rows = sqlx::query_as::<_, FeedRow>(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds \
             WHERE (last_fetched IS NULL OR last_fetched <= ?) \
             AND NOT (consecutive_failures >= ? \
                      AND last_attempted IS NOT NULL AND last_attempted > ?) \
             ORDER BY id"
        ))
        .bind(cutoff)
        .bind(Self::QUARANTINE_THRESHOLD)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(FeedRow::into_feed).collect())
    }

    // ========================================================================
    // Refresh Lock
    // ========================================================================

    /// Claim the refresh lock for a feed.
    ///
    /// Single conditional UPDATE: it matches only while the lock is absent or
    /// expired, and SQLite applies it atomically per row, so among any number
    /// of concurrent callers exactly one gets `Some(lease)`.
    ///
    /// A lease that is never released stops blocking other callers once
    /// `now > expires_at`.
    pub async fn try_acquire_refresh_lock(
        &self,
        feed_id: i64,
        now: i64,
        ttl_secs: i64,
    ) -> Result<Option<RefreshLease>, DatabaseError> {
        self.claim_refresh_lock(feed_id, now, ttl_secs, None).await
    }

    /// [`Database::try_acquire_refresh_lock`] that also requires the feed to
    /// be stale at `now`, evaluated inside the same UPDATE.
    ///
    /// A caller holding an old snapshot of the feed cannot claim it after
    /// someone else's successful refresh has landed.
    pub async fn try_acquire_stale_refresh_lock(
        &self,
        feed_id: i64,
        now: i64,
        ttl_secs: i64,
        window_secs: i64,
    ) -> Result<Option<RefreshLease>, DatabaseError> {
        self.claim_refresh_lock(feed_id, now, ttl_secs, Some(now.saturating_sub(window_secs)))
            .await
    }

    async fn claim_refresh_lock(
        &self,
        feed_id: i64,
        now: i64,
        ttl_secs: i64,
        fetched_before: Option<i64>,
    ) -> Result<Option<RefreshLease>, DatabaseError> {
        // ttl of zero would hand two consecutive claims the same token
        let expires_at = now.saturating_add(ttl_secs.max(1));
        let result = sqlx::query(
            "UPDATE feeds SET lock_until = ? \
             WHERE id = ? AND (lock_until IS NULL OR lock_until < ?) \
             AND (? IS NULL OR last_fetched IS NULL OR last_fetched <= ?)",
        )
        .bind(expires_at)
        .bind(feed_id)
        .bind(now)
        .bind(fetched_before)
        .bind(fetched_before)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            Ok(Some(RefreshLease {
                feed_id,
                expires_at,
            }))
        } else {
            Ok(None)
        }
    }

    /// Threshold of consecutive failures after which a feed is quarantined
    pub const QUARANTINE_THRESHOLD: i64 = 5;

    /// Release a refresh lease and record the outcome.
    ///
    /// Success credits freshness (`last_fetched = now`) and resets the failure
    /// count. Failure only bumps the failure count and remembers the error, so
    /// the feed stays stale and is picked up again by the next staleness check.
    ///
    /// The lock column is cleared only while it still carries this lease's
    /// expiry. Returns `false` when the lease had already expired and been
    /// re-claimed by someone else; the outcome is recorded either way.
    pub async fn release_refresh_lock(
        &self,
        lease: RefreshLease,
        status: RefreshStatus<'_>,
        now: i64,
    ) -> Result<bool, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let cleared = sqlx::query("UPDATE feeds SET lock_until = NULL WHERE id = ? AND lock_until = ?")
            .bind(lease.feed_id)
            .bind(lease.expires_at)
            .execute(&mut *tx)
            .await?;

        match status {
            RefreshStatus::Succeeded => {
                sqlx::query(
                    "UPDATE feeds SET last_fetched = ?, last_attempted = ?, \
                     consecutive_failures = 0, error = NULL WHERE id = ?",
                )
                .bind(now)
                .bind(now)
                .bind(lease.feed_id)
                .execute(&mut *tx)
                .await?;
            }
            RefreshStatus::Failed(error) => {
                sqlx::query(
                    "UPDATE feeds SET last_attempted = ?, \
                     consecutive_failures = consecutive_failures + 1, error = ? WHERE id = ?",
                )
                .bind(now)
                .bind(error)
                .bind(lease.feed_id)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        let owned = cleared.rows_affected() == 1;
        if !owned {
            tracing::warn!(
                feed_id = lease.feed_id,
                expires_at = lease.expires_at,
                "Refresh lease expired before release; lock left to its current owner"
            );
        }
        Ok(owned)
    }
}
