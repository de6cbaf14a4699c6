//! API route handlers for the history index server.

pub mod health;
pub mod live;
pub mod metrics;
pub mod projects;
pub mod sessions;
pub mod status;

use std::sync::Arc;

use axum::Router;

use crate::state::AppState;

/// Create the combined API router with all routes under /api prefix.
///
/// Routes:
/// - GET    /api/health - Health check
/// - GET    /api/sessions?q=&project= - List, search or filter sessions
/// - GET    /api/sessions/{id}?transcript=true&limit=N - One session
/// - DELETE /api/sessions/{id} - Delete a session from disk and the index
/// - GET    /api/projects - List projects
/// - GET    /api/projects/{id}/sessions - Sessions of one project
/// - GET    /api/cache/stats - Index cache counters
/// - GET    /api/live/stream - SSE stream of change notifications
/// - GET    /metrics - Prometheus metrics (no /api prefix)
pub fn api_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .nest("/api", health::router())
        .nest("/api", sessions::router())
        .nest("/api", projects::router())
        .nest("/api", status::router())
        .nest("/api", live::router())
        .merge(metrics::router())
        .with_state(state)
}
