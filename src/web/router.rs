use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers::{feed_entries, health, request_refresh, stale_feeds, stream};
use super::AppState;

/// Build the full HTTP router.
pub fn create_router(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        .route("/stream", get(stream))
        .route("/feeds/stale", post(stale_feeds))
        .route("/feeds/:id/entries", get(feed_entries))
        .route("/refresh", post(request_refresh));

    Router::new()
        .route("/health", get(health))
        .nest("/api", api_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
