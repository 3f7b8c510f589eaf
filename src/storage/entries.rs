use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{DatabaseError, Entry, EntryRow, ParsedEntry};

// ============================================================================
// Query Limit Constants
// ============================================================================

/// Maximum number of entries returned from any single listing (OOM protection)
const MAX_ENTRIES: i64 = 2000;

/// 10 bound columns per row keeps a chunk well under SQLite's parameter limit
const INSERT_BATCH_SIZE: usize = 40;

const ENTRY_COLUMNS: &str = "id, feed_id, guid, title, link, description, published, image, \
     enclosure_url, enclosure_type, fetched_at";

impl Database {
    // ========================================================================
    // Entry Writer
    // ========================================================================

    /// Insert entries that are not yet stored, returning how many were new.
    ///
    /// `INSERT OR IGNORE` against `UNIQUE(feed_id, guid)`: rows that already
    /// exist are left exactly as first written. Re-running the same batch
    /// after a crash or redelivery inserts nothing. Entries without a publish
    /// date are stamped with `fetched_at`.
    pub async fn insert_entries(
        &self,
        feed_id: i64,
        entries: &[ParsedEntry],
        fetched_at: i64,
    ) -> Result<usize, DatabaseError> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut inserted: u64 = 0;

        for chunk in entries.chunks(INSERT_BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT OR IGNORE INTO entries (feed_id, guid, title, link, description, \
                 published, image, enclosure_url, enclosure_type, fetched_at) ",
            );

            builder.push_values(chunk, |mut b, entry| {
                let enclosure = entry.enclosure.as_ref();
                b.push_bind(feed_id)
                    .push_bind(&entry.guid)
                    .push_bind(&entry.title)
                    .push_bind(&entry.link)
                    .push_bind(&entry.description)
                    .push_bind(entry.published.unwrap_or(fetched_at))
                    .push_bind(&entry.image)
                    .push_bind(enclosure.map(|e| e.url.as_str()))
                    .push_bind(enclosure.and_then(|e| e.media_type.as_deref()))
                    .push_bind(fetched_at);
            });

            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted as usize)
    }

    // ========================================================================
    // Entry Queries
    // ========================================================================

    /// Newest entries of one feed, `(published DESC, id DESC)`.
    /// Hard cap at MAX_ENTRIES.
    pub async fn entries_for_feed(
        &self,
        feed_id: i64,
        limit: i64,
    ) -> Result<Vec<Entry>, DatabaseError> {
        let limit = limit.clamp(0, MAX_ENTRIES);
        let rows = sqlx::query_as::<_, EntryRow>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE feed_id = ? \
             ORDER BY published DESC, id DESC LIMIT ?"
        ))
        .bind(feed_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(EntryRow::into_entry).collect())
    }

    /// One slice of the merged stream across `feed_ids`.
    ///
    /// Union and sort happen in SQLite: `(published DESC, id DESC)` is a total
    /// order, so identical calls always return identical slices and
    /// consecutive offsets never overlap or skip rows.
    pub async fn page_entries(
        &self,
        feed_ids: &[i64],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Entry>, DatabaseError> {
        if feed_ids.is_empty() || limit <= 0 {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE feed_id IN ("
        ));
        let mut separated = builder.separated(", ");
        for id in feed_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY published DESC, id DESC LIMIT ");
        builder.push_bind(limit.min(MAX_ENTRIES));
        builder.push(" OFFSET ");
        builder.push_bind(offset.max(0));

        let rows: Vec<EntryRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(EntryRow::into_entry).collect())
    }

    /// Total number of stored entries across `feed_ids`
    pub async fn count_entries(&self, feed_ids: &[i64]) -> Result<i64, DatabaseError> {
        if feed_ids.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM entries WHERE feed_id IN (");
        let mut separated = builder.separated(", ");
        for id in feed_ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let row: (i64,) = builder.build_query_as().fetch_one(&self.pool).await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, Enclosure, ParsedEntry};

    async fn test_db() -> Database {
        Database::open(":memory:").await.unwrap()
    }

    fn test_entry(guid: &str, published: i64) -> ParsedEntry {
        ParsedEntry {
            guid: guid.to_string(),
            title: format!("Entry {}", guid),
            link: format!("https://example.com/{}", guid),
            description: Some("Snippet".to_string()),
            published: Some(published),
            image: None,
            enclosure: None,
        }
    }

    #[tokio::test]
    async fn test_insert_entries_counts_new_rows() {
        let db = test_db().await;
        let feed = db
            .register_feed("https://a.example.com/rss", "A", None)
            .await
            .unwrap();

        let count = db
            .insert_entries(feed, &[test_entry("1", 10), test_entry("2", 20)], 100)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_insert_entries_idempotent() {
        let db = test_db().await;
        let feed = db
            .register_feed("https://a.example.com/rss", "A", None)
            .await
            .unwrap();
        let batch = vec![test_entry("1", 10), test_entry("2", 20), test_entry("3", 30)];

        db.insert_entries(feed, &batch, 100).await.unwrap();
        let again = db.insert_entries(feed, &batch, 200).await.unwrap();
        assert_eq!(again, 0);
        assert_eq!(db.count_entries(&[feed]).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_first_write_wins() {
        let db = test_db().await;
        let feed = db
            .register_feed("https://a.example.com/rss", "A", None)
            .await
            .unwrap();

        db.insert_entries(feed, &[test_entry("1", 10)], 100)
            .await
            .unwrap();

        let mut republished = test_entry("1", 99);
        republished.title = "Edited upstream".to_string();
        let count = db.insert_entries(feed, &[republished], 200).await.unwrap();
        assert_eq!(count, 0);

        let stored = db.entries_for_feed(feed, 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(&*stored[0].title, "Entry 1");
        assert_eq!(stored[0].published, 10);
        assert_eq!(stored[0].fetched_at, 100);
    }

    #[tokio::test]
    async fn test_same_guid_in_different_feeds_is_distinct() {
        let db = test_db().await;
        let a = db
            .register_feed("https://a.example.com/rss", "A", None)
            .await
            .unwrap();
        let b = db
            .register_feed("https://b.example.com/rss", "B", None)
            .await
            .unwrap();

        assert_eq!(db.insert_entries(a, &[test_entry("x", 1)], 5).await.unwrap(), 1);
        assert_eq!(db.insert_entries(b, &[test_entry("x", 1)], 5).await.unwrap(), 1);
        assert_eq!(db.count_entries(&[a, b]).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_publish_date_uses_fetch_time() {
        let db = test_db().await;
        let feed = db
            .register_feed("https://a.example.com/rss", "A", None)
            .await
            .unwrap();
        let mut entry = test_entry("undated", 0);
        entry.published = None;
        entry.enclosure = Some(Enclosure {
            url: "https://cdn.example.com/ep1.mp3".to_string(),
            media_type: Some("audio/mpeg".to_string()),
        });

        db.insert_entries(feed, &[entry], 4242).await.unwrap();

        let stored = db.entries_for_feed(feed, 10).await.unwrap();
        assert_eq!(stored[0].published, 4242);
        assert_eq!(
            stored[0].enclosure.as_ref().map(|e| e.url.as_str()),
            Some("https://cdn.example.com/ep1.mp3")
        );
    }

    #[tokio::test]
    async fn test_insert_large_batch_chunks() {
        let db = test_db().await;
        let feed = db
            .register_feed("https://a.example.com/rss", "A", None)
            .await
            .unwrap();
        let batch: Vec<_> = (0..130).map(|i| test_entry(&i.to_string(), i)).collect();

        assert_eq!(db.insert_entries(feed, &batch, 1).await.unwrap(), 130);
        assert_eq!(db.insert_entries(feed, &batch, 2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_page_entries_orders_ties_by_id_desc() {
        let db = test_db().await;
        let feed = db
            .register_feed("https://a.example.com/rss", "A", None)
            .await
            .unwrap();
        db.insert_entries(
            feed,
            &[test_entry("first", 50), test_entry("second", 50), test_entry("third", 50)],
            1,
        )
        .await
        .unwrap();

        let page = db.page_entries(&[feed], 0, 10).await.unwrap();
        let guids: Vec<_> = page.iter().map(|e| e.guid.as_str()).collect();
        assert_eq!(guids, vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn test_page_entries_empty_inputs() {
        let db = test_db().await;
        assert!(db.page_entries(&[], 0, 10).await.unwrap().is_empty());
        assert_eq!(db.count_entries(&[]).await.unwrap(), 0);
    }
}
