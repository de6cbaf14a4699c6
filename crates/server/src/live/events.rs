//! Change notifications flowing from the watcher to subscribers.

use serde::{Deserialize, Serialize};

/// What changed on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeKind {
    /// A session transcript was written.
    SessionChanged,
    /// The set of sessions may have changed (new file, deletion).
    SessionListChanged,
    /// A derived (agent) transcript of some session was written.
    AgentSessionChanged,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 3] = [
        ChangeKind::SessionChanged,
        ChangeKind::SessionListChanged,
        ChangeKind::AgentSessionChanged,
    ];

    /// Event name used on the push stream.
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::SessionChanged => "sessionChanged",
            ChangeKind::SessionListChanged => "sessionListChanged",
            ChangeKind::AgentSessionChanged => "agentSessionChanged",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// Encoded project directory name.
    pub container_id: String,
    /// Session id, or the agent id for derived sessions.
    pub entity_id: String,
    /// Unix milliseconds at emission.
    pub timestamp: i64,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, container_id: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            kind,
            container_id: container_id.into(),
            entity_id: entity_id.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
