//! Index cache status endpoint.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use history_index_core::CacheStats;

use crate::error::ApiResult;
use crate::state::AppState;

/// GET /api/cache/stats - Entity and container counts plus the log watermark.
///
/// Reports the snapshot as it currently stands; does not trigger a load.
pub async fn get_cache_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<CacheStats>> {
    Ok(Json(state.repository.get_cache_stats()))
}

/// Create the status routes router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/cache/stats", get(get_cache_stats))
}
