//! Push stream of index change notifications.
//!
//! - `GET /api/live/stream` -- SSE relay of the change gateway

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Router,
};

use crate::live::gateway::GatewayMessage;
use crate::state::AppState;

/// Build the live sub-router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/live/stream", get(live_stream))
}

/// GET /api/live/stream -- SSE stream of change notifications.
///
/// # Events
///
/// | Event name            | When emitted                          |
/// |-----------------------|---------------------------------------|
/// | `connected`           | Once, on connect                      |
/// | `sessionChanged`      | A session transcript changed          |
/// | `sessionListChanged`  | A session appeared or was deleted     |
/// | `agentSessionChanged` | An agent transcript changed           |
/// | `heartbeat`           | On the gateway's heartbeat interval   |
///
/// The stream ends when the gateway drops this subscriber, which happens if
/// the client falls too far behind.
pub async fn live_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let mut subscriber = state.gateway.connect();

    let stream = async_stream::stream! {
        while let Some(message) = subscriber.recv().await {
            yield Ok(to_sse_event(&message));
        }
        tracing::debug!(subscriber = subscriber.id(), "SSE subscriber stream closed");
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keep-alive"),
    )
}

fn to_sse_event(message: &GatewayMessage) -> Event {
    Event::default()
        .id(message.id.clone())
        .event(message.event.clone())
        .data(serde_json::to_string(message).unwrap_or_default())
}
