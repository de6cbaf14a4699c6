// crates/server/src/lib.rs
//! History index server library.
//!
//! Wires the core session index to an Axum HTTP API, a directory watcher
//! feeding an in-process event bus, and a push gateway streaming change
//! notifications to connected clients.

pub mod config;
pub mod error;
pub mod live;
pub mod metrics;
pub mod routes;
pub mod state;

pub use error::*;
pub use metrics::{init_metrics, render_metrics};
pub use routes::api_routes;
pub use state::AppState;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the Axum application with all routes and middleware.
///
/// This sets up:
/// - API routes under `/api` plus `/metrics`
/// - CORS for local tooling (allows any origin)
/// - Request tracing
pub fn create_app(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api_routes(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use axum::Router;
    use history_index_core::SessionRepository;

    use crate::live::bus::EventBus;
    use crate::live::gateway::{ChangeGateway, DEFAULT_HEARTBEAT};
    use crate::live::refresh::register_refresh;
    use crate::state::AppState;

    /// Two projects: `/work/alpha` (session `s1` with a transcript) and
    /// `/work/beta` (session `s2`, log only).
    pub fn test_state() -> (tempfile::TempDir, Arc<AppState>) {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("history.jsonl");
        let projects = tmp.path().join("projects");

        std::fs::write(
            &log,
            concat!(
                r#"{"sessionId":"s1","display":"fix the parser","timestamp":1700000000000,"project":"/work/alpha"}"#,
                "\n",
                r#"{"sessionId":"s2","display":"write release notes","timestamp":1700000500000,"project":"/work/beta"}"#,
                "\n",
                r#"{"sessionId":"s1","display":"add a regression test","timestamp":1700000100000,"project":"/work/alpha"}"#,
                "\n",
            ),
        )
        .unwrap();

        let folder = projects.join("-work-alpha");
        std::fs::create_dir_all(&folder).unwrap();
        std::fs::write(
            folder.join("s1.jsonl"),
            concat!(
                r#"{"uuid":"u1","timestamp":"2023-11-14T22:13:20Z","type":"user","message":{"content":"fix the parser"},"cwd":"/work/alpha"}"#,
                "\n",
                r#"{"uuid":"a1","timestamp":"2023-11-14T22:13:25Z","type":"assistant","message":{"content":[{"type":"text","text":"Done."}]}}"#,
                "\n",
                r#"{"uuid":"u2","timestamp":"2023-11-14T22:15:00Z","type":"user","message":{"content":"add a regression test"},"cwd":"/work/alpha"}"#,
                "\n",
                r#"{"uuid":"a2","timestamp":"2023-11-14T22:15:09Z","type":"assistant","message":{"content":[{"type":"text","text":"Added."}]}}"#,
                "\n",
            ),
        )
        .unwrap();

        let repository = Arc::new(SessionRepository::new(log, projects));
        let bus = EventBus::new();
        let relay = EventBus::new();
        register_refresh(&bus, Arc::clone(&repository), relay.clone());
        let gateway = ChangeGateway::new(relay, DEFAULT_HEARTBEAT);
        let state = AppState::new(repository, bus, gateway);
        (tmp, state)
    }

    pub fn test_app() -> (tempfile::TempDir, Router) {
        let (tmp, state) = test_state();
        (tmp, crate::create_app(state))
    }
}

// ============================================================================
// Integration Tests
// ============================================================================
