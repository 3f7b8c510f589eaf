use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use super::error::ApiError;
use super::AppState;
use crate::refresh::{RefreshBatch, WorkItem};
use crate::stream::{
    CacheKey, CacheStats, FeedListing, MergedPage, PageRequest, DEFAULT_PAGE_SIZE,
};

const DEFAULT_LISTING_LIMIT: i64 = 10;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub page_cache: CacheStats,
    pub listing_cache: CacheStats,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        page_cache: state.cache.pages.stats(),
        listing_cache: state.cache.listings.stats(),
    })
}

/// `feedIds` and `postTitles` are comma-separated lists.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    pub feed_ids: Option<String>,
    pub post_titles: Option<String>,
    pub offset: Option<i64>,
    /// 1-based, used when `offset` is absent
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    #[serde(default)]
    pub refresh: bool,
    pub viewer: Option<String>,
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_feed_ids(raw: &str) -> Result<Vec<i64>, ApiError> {
    split_list(raw)
        .map(|s| {
            s.parse::<i64>()
                .map_err(|_| ApiError::bad_request(format!("Invalid feed id: {s:?}")))
        })
        .collect()
}

/// Merged page across the requested feeds.
///
/// Store and metrics failures degrade the page rather than failing the
/// request; only malformed parameters are rejected.
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
) -> Result<Json<MergedPage>, ApiError> {
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    let viewer = query.viewer.filter(|v| !v.is_empty());

    let mut feed_ids = match (&query.feed_ids, &query.post_titles) {
        (Some(ids), _) => parse_feed_ids(ids)?,
        (None, Some(_)) => Vec::new(),
        (None, None) => return Err(ApiError::bad_request("Either feedIds or postTitles is required")),
    };

    if let Some(titles) = &query.post_titles {
        let titles: Vec<String> = split_list(titles).map(str::to_string).collect();
        match state.engine.resolve_titles(&titles).await {
            Ok(ids) => feed_ids.extend(ids),
            Err(e) => {
                tracing::warn!(error = %e, "Title resolution failed");
                let request = PageRequest::new(feed_ids, query.offset.unwrap_or(0), page_size);
                return Ok(Json(MergedPage::degraded(&request, "entry store unavailable")));
            }
        }
    }

    let request = match (query.offset, query.page) {
        (Some(offset), _) => PageRequest::new(feed_ids, offset, page_size),
        (None, Some(page)) => PageRequest::from_page(feed_ids, page, page_size),
        (None, None) => PageRequest::new(feed_ids, 0, page_size),
    }
    .with_viewer(viewer);

    if query.refresh {
        state.cache.pages.invalidate_feeds(&request.feed_ids);
    }

    let key = CacheKey::stream(
        &request.feed_ids,
        request.offset,
        request.page_size,
        request.viewer.as_deref(),
    );
    let engine = &state.engine;
    let page = state
        .cache
        .pages
        .get_or_compute(key, state.cache.ttl, || engine.page(&request))
        .await;
    Ok(Json(page))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListingQuery {
    pub limit: Option<i64>,
    #[serde(default)]
    pub refresh: bool,
}

pub async fn feed_entries(
    State(state): State<Arc<AppState>>,
    Path(feed_id): Path<i64>,
    Query(query): Query<ListingQuery>,
) -> Result<Json<FeedListing>, ApiError> {
    match state.db.get_feed(feed_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(ApiError::not_found(format!("Feed {feed_id} not found"))),
        // The listing below degrades on its own
        Err(e) => tracing::warn!(feed_id, error = %e, "Feed lookup failed"),
    }

    let limit = query.limit.unwrap_or(DEFAULT_LISTING_LIMIT);
    if query.refresh {
        state.cache.listings.invalidate_feeds(&[feed_id]);
    }

    let engine = &state.engine;
    let listing = state
        .cache
        .listings
        .get_or_compute(CacheKey::FeedEntries { feed_id, limit }, state.cache.ttl, || {
            engine.feed_entries(feed_id, limit)
        })
        .await;
    Ok(Json(listing))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleRequest {
    pub post_titles: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaleResponse {
    pub stale_feed_titles: Vec<String>,
}

pub async fn stale_feeds(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StaleRequest>,
) -> Result<Json<StaleResponse>, ApiError> {
    let stale_feed_titles = state.dispatcher.stale_titles(&body.post_titles).await?;
    Ok(Json(StaleResponse { stale_feed_titles }))
}

/// Body of `POST /api/refresh`. `batchId` is generated when absent.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    #[serde(default)]
    pub batch_id: Option<String>,
    pub feeds: Vec<WorkItem>,
    #[serde(default)]
    pub existing_guids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshAccepted {
    pub batch_id: String,
    pub queued: usize,
}

pub async fn request_refresh(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RefreshRequest>,
) -> Result<(StatusCode, Json<RefreshAccepted>), ApiError> {
    if body.feeds.is_empty() {
        return Err(ApiError::bad_request("feeds must not be empty"));
    }
    if let Some(item) = body.feeds.iter().find(|f| f.feed_url.trim().is_empty()) {
        return Err(ApiError::bad_request(format!(
            "feedUrl is required (postTitle {:?})",
            item.post_title
        )));
    }

    let batch_id = body
        .batch_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| {
            let seq = state.batch_seq.fetch_add(1, Ordering::Relaxed);
            format!("api-{}-{seq}", chrono::Utc::now().timestamp_millis())
        });
    let queued = body.feeds.len();

    state
        .queue
        .publish(RefreshBatch {
            batch_id: batch_id.clone(),
            feeds: body.feeds,
            existing_guids: body.existing_guids,
        })
        .await?;

    tracing::info!(batch_id = %batch_id, feeds = queued, "Refresh batch queued");
    Ok((StatusCode::ACCEPTED, Json(RefreshAccepted { batch_id, queued })))
}
