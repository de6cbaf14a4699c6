// crates/server/src/state.rs
//! Application state for the Axum server.

use std::sync::Arc;
use std::time::Instant;

use history_index_core::SessionRepository;

use crate::live::bus::EventBus;
use crate::live::gateway::ChangeGateway;

/// Shared application state accessible from all route handlers.
///
/// Everything here is constructed by the caller and injected; there are no
/// process-wide singletons besides the metrics recorder.
pub struct AppState {
    /// Server start time for uptime tracking.
    pub start_time: Instant,
    pub repository: Arc<SessionRepository>,
    pub bus: EventBus,
    pub gateway: ChangeGateway,
}

impl AppState {
    /// `bus` is where raw change events enter the pipeline; `gateway`
    /// relays them to clients once the index has caught up.
    pub fn new(repository: Arc<SessionRepository>, bus: EventBus, gateway: ChangeGateway) -> Arc<Self> {
        Arc::new(Self {
            start_time: Instant::now(),
            repository,
            bus,
            gateway,
        })
    }

    /// Get the server uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::gateway::DEFAULT_HEARTBEAT;

    fn test_state() -> Arc<AppState> {
        let repository = Arc::new(SessionRepository::new("/nonexistent/h.jsonl", "/nonexistent/projects"));
        let gateway = ChangeGateway::new(EventBus::new(), DEFAULT_HEARTBEAT);
        AppState::new(repository, EventBus::new(), gateway)
    }

    #[test]
    fn test_app_state_new() {
        let state = test_state();
        assert!(state.uptime_secs() < 1);
        assert_eq!(state.gateway.subscriber_count(), 0);
    }

    #[test]
    fn test_app_state_clone() {
        let state = test_state();
        let cloned = state.clone();
        assert_eq!(state.uptime_secs(), cloned.uptime_secs());
    }
}
