// crates/core/src/types.rs
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::paths::{display_name, normalize_path, project_id};

/// Message role in a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Whether a turn is visible text or a reasoning trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TurnKind {
    Text,
    Reasoning,
}

/// One prompt typed by the user, as recorded in the history log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInput {
    pub display: String,
    /// Unix milliseconds.
    pub timestamp: i64,
}

/// One chat turn read from a transcript file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatTurn {
    pub role: Role,
    pub text: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub kind: TurnKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

/// Which source a session was first built from.
///
/// Log-sourced sessions take their inputs from the history log only; a
/// transcript re-read refreshes their turn count and activity window.
/// Transcript-sourced sessions are rebuilt whole on every re-read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionSource {
    #[default]
    Log,
    Transcript,
}

/// One conversation.
///
/// `turns` stays empty inside index snapshots; it is filled on demand by
/// `SessionRepository::get_session_with_transcript`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub project_path: String,
    pub project_id: String,
    pub inputs: Vec<UserInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub turns: Vec<ChatTurn>,
    pub created_at: i64,
    pub updated_at: i64,
    pub input_count: usize,
    pub turn_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript_path: Option<PathBuf>,
    #[serde(default)]
    pub source: SessionSource,
}

impl Session {
    pub fn new(id: impl Into<String>, project_path: &str, timestamp: i64) -> Self {
        let project_path = normalize_path(project_path);
        Self {
            id: id.into(),
            project_id: project_id(&project_path),
            project_path,
            inputs: Vec::new(),
            turns: Vec::new(),
            created_at: timestamp,
            updated_at: timestamp,
            input_count: 0,
            turn_count: 0,
            transcript_path: None,
            source: SessionSource::Log,
        }
    }

    /// Widen the activity window to include `timestamp`.
    pub fn observe(&mut self, timestamp: i64) {
        self.created_at = self.created_at.min(timestamp);
        self.updated_at = self.updated_at.max(timestamp);
    }

    pub fn push_input(&mut self, display: impl Into<String>, timestamp: i64) {
        self.inputs.push(UserInput {
            display: display.into(),
            timestamp,
        });
        self.input_count += 1;
        self.observe(timestamp);
    }

    /// Stable sort, so inputs sharing a timestamp keep file order.
    pub fn sort_inputs(&mut self) {
        self.inputs.sort_by_key(|input| input.timestamp);
    }
}

/// One logical container (a workspace path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub path: String,
    pub id: String,
    pub name: String,
    pub session_count: usize,
    pub last_active: i64,
}

impl Project {
    pub fn new(path: &str) -> Self {
        let path = normalize_path(path);
        Self {
            id: project_id(&path),
            name: display_name(&path),
            path,
            session_count: 0,
            last_active: 0,
        }
    }
}

/// Dirty-tracking record for one transcript file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileCacheEntry {
    /// Modification time truncated to whole milliseconds.
    pub mtime_ms: i64,
    pub size: u64,
}

impl FileCacheEntry {
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        Self {
            mtime_ms: mtime_millis(metadata).unwrap_or(0),
            size: metadata.len(),
        }
    }
}

/// Modification time of a file in Unix milliseconds.
pub fn mtime_millis(metadata: &std::fs::Metadata) -> Option<i64> {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
}

/// Summary counters of the index cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entity_count: usize,
    pub container_count: usize,
    pub watermark: Option<i64>,
}
