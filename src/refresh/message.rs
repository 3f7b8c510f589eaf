use serde::{Deserialize, Serialize};

/// A batch of refresh requests as delivered by the queue transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshBatch {
    pub batch_id: String,
    pub feeds: Vec<WorkItem>,
    /// GUIDs the caller already has; matching entries are not written
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub existing_guids: Vec<String>,
}

/// One feed to refresh. `feed_id` wins when given and known; otherwise the
/// feed is looked up (or registered) by URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_id: Option<i64>,
    #[serde(default)]
    pub post_title: String,
    pub feed_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
}

/// Sent to the notification callback after a batch is handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshNotification {
    pub batch_id: String,
    /// False when at least one feed in the batch failed
    pub success: bool,
    pub refreshed_any: bool,
    pub new_entries_count: usize,
    /// Stored entries across every feed in the batch
    pub total_entries: i64,
    pub post_titles: Vec<String>,
    /// RFC 3339
    pub refresh_timestamp: String,
}
