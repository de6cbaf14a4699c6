// crates/server/src/routes/sessions.rs
//! Session listing, detail and deletion endpoints.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use history_index_core::paths::encode_dir_name;
use history_index_core::{DeleteOutcome, Session};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::live::events::{ChangeEvent, ChangeKind};
use crate::state::AppState;

/// Query parameters for GET /api/sessions
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SessionsListQuery {
    /// Case-insensitive substring over the session's prompts.
    pub q: Option<String>,
    /// Restrict to one project path.
    pub project: Option<String>,
}

/// Response for GET /api/sessions
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
#[serde(rename_all = "camelCase")]
pub struct SessionsListResponse {
    pub sessions: Vec<Session>,
    pub total: usize,
}

/// Query parameters for GET /api/sessions/{id}
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SessionDetailQuery {
    /// Include chat turns read from the transcript.
    pub transcript: bool,
    /// Keep only the most recent N turns.
    pub limit: Option<usize>,
}

/// GET /api/sessions - List, search or filter sessions by project.
///
/// Most recently active first. With both `q` and `project`, both apply.
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionsListQuery>,
) -> ApiResult<Json<SessionsListResponse>> {
    state.repository.load_all().await;

    let mut sessions = match query.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        Some(q) => state.repository.search(q),
        None => state.repository.list_sessions(),
    };
    if let Some(project) = query.project.as_deref() {
        let project = history_index_core::paths::normalize_path(project);
        sessions.retain(|s| s.project_path == project);
    }

    Ok(Json(SessionsListResponse {
        total: sessions.len(),
        sessions,
    }))
}

/// GET /api/sessions/{id} - One session, optionally with its recent turns.
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<SessionDetailQuery>,
) -> ApiResult<Json<Session>> {
    if query.limit == Some(0) {
        return Err(ApiError::BadRequest("limit must be at least 1".to_string()));
    }
    state.repository.load_all().await;

    let session = if query.transcript {
        state
            .repository
            .get_session_with_transcript(&id, query.limit)
            .await
    } else {
        state.repository.get_session(&id)
    };

    session.map(Json).ok_or(ApiError::SessionNotFound(id))
}

/// DELETE /api/sessions/{id} - Remove a session from disk and from the index.
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeleteOutcome>> {
    state.repository.load_all().await;
    let session = state
        .repository
        .get_session(&id)
        .ok_or_else(|| ApiError::SessionNotFound(id.clone()))?;

    let outcome = state.repository.delete_session(&id).await?;

    state.bus.emit(ChangeEvent::new(
        ChangeKind::SessionListChanged,
        container_of(&session),
        id,
    ));
    Ok(Json(outcome))
}

/// Encoded project directory of a session, as the watcher would report it.
fn container_of(session: &Session) -> String {
    session
        .transcript_path
        .as_deref()
        .and_then(|p| p.parent())
        .and_then(|p| p.file_name())
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| encode_dir_name(&session.project_path))
}

/// Create the sessions routes router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
}
