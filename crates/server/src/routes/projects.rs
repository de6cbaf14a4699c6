// crates/server/src/routes/projects.rs
//! Projects listing endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use history_index_core::paths::project_path_from_id;
use history_index_core::Project;

use crate::error::{ApiError, ApiResult};
use crate::routes::sessions::SessionsListResponse;
use crate::state::AppState;

/// GET /api/projects - All projects, most recently active first.
pub async fn list_projects(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Project>>> {
    state.repository.load_all().await;
    Ok(Json(state.repository.list_containers()))
}

/// GET /api/projects/{id}/sessions - Sessions of one project.
///
/// `id` is the project's URL-safe slug as returned by `/api/projects`.
pub async fn list_project_sessions(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionsListResponse>> {
    let path = project_path_from_id(&id).ok_or_else(|| ApiError::ProjectNotFound(id.clone()))?;
    state.repository.load_all().await;

    let sessions = state.repository.list_by_container(&path);
    if sessions.is_empty() {
        return Err(ApiError::ProjectNotFound(id));
    }
    Ok(Json(SessionsListResponse {
        total: sessions.len(),
        sessions,
    }))
}

/// Create the projects routes router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/projects", get(list_projects))
        .route("/projects/{id}/sessions", get(list_project_sessions))
}
