use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// The database file is held by another process and could not be opened
    #[error("Database is locked by another process. Please close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Input Types
// ============================================================================

/// Media enclosure attached to an entry (podcast audio, video, etc.)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enclosure {
    pub url: String,
    pub media_type: Option<String>,
}

/// An entry produced by the parser, not yet persisted
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEntry {
    pub guid: String,
    pub title: String,
    pub link: String,
    pub description: Option<String>,
    /// Unix seconds. `None` when the source carried no usable date.
    pub published: Option<i64>,
    pub image: Option<String>,
    pub enclosure: Option<Enclosure>,
}

// ============================================================================
// Row Types
// ============================================================================

/// Row type for feed queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedRow {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub media_type: Option<String>,
    pub last_fetched: Option<i64>,
    pub lock_until: Option<i64>,
    pub last_attempted: Option<i64>,
    pub consecutive_failures: i64,
    pub error: Option<String>,
}

impl FeedRow {
    pub(crate) fn into_feed(self) -> Feed {
        Feed {
            id: self.id,
            title: Arc::from(self.title),
            url: self.url,
            media_type: self.media_type,
            last_fetched: self.last_fetched,
            lock_until: self.lock_until,
            last_attempted: self.last_attempted,
            consecutive_failures: self.consecutive_failures,
            error: self.error,
        }
    }
}

/// Internal row type for Entry queries (used by sqlx FromRow)
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct EntryRow {
    pub id: i64,
    pub feed_id: i64,
    pub guid: String,
    pub title: String,
    pub link: String,
    pub description: Option<String>,
    pub published: i64,
    pub image: Option<String>,
    pub enclosure_url: Option<String>,
    pub enclosure_type: Option<String>,
    pub fetched_at: i64,
}

impl EntryRow {
    pub(crate) fn into_entry(self) -> Entry {
        let enclosure = self.enclosure_url.map(|url| Enclosure {
            url,
            media_type: self.enclosure_type,
        });
        Entry {
            id: self.id,
            feed_id: self.feed_id,
            guid: self.guid,
            title: Arc::from(self.title),
            link: self.link,
            description: self.description.map(Arc::from),
            published: self.published,
            image: self.image,
            enclosure,
            fetched_at: self.fetched_at,
        }
    }
}

// ============================================================================
// Data Structures
// ============================================================================

/// Feed registry record.
///
/// `lock_until` and `last_fetched` are only ever mutated through the refresh
/// lock primitives in `storage::feeds`.
#[derive(Debug, Clone)]
pub struct Feed {
    pub id: i64,
    pub title: Arc<str>,
    pub url: String,
    pub media_type: Option<String>,
    /// Unix seconds of the last successful refresh
    pub last_fetched: Option<i64>,
    /// Lock expiry in unix seconds; `None` or past means unlocked
    pub lock_until: Option<i64>,
    /// Unix seconds of the last failed refresh attempt
    pub last_attempted: Option<i64>,
    pub consecutive_failures: i64,
    pub error: Option<String>,
}

/// Persisted entry. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: i64,
    pub feed_id: i64,
    pub guid: String,
    pub title: Arc<str>,
    pub link: String,
    pub description: Option<Arc<str>>,
    pub published: i64,
    pub image: Option<String>,
    pub enclosure: Option<Enclosure>,
    pub fetched_at: i64,
}

/// Proof of a successful lock claim, required to release it.
///
/// `expires_at` doubles as the ownership token: release only clears the lock
/// while `lock_until` still holds this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshLease {
    pub feed_id: i64,
    pub expires_at: i64,
}

/// How a refresh ended, recorded when its lease is released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStatus<'a> {
    Succeeded,
    Failed(&'a str),
}
