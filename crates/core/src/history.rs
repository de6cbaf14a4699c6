//! Parser for the append-only `history.jsonl` prompt log.
//!
//! Each line is `{"sessionId", "display", "timestamp", "project"}`. Lines are
//! folded into [`Session`] aggregates in file order; a line that does not
//! parse or lacks `sessionId`/`timestamp` is skipped without aborting the
//! pass. The log only ever grows, so after the first full pass the byte
//! offset of the last folded line is kept and later passes read only what
//! was appended since.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, warn};

use crate::paths::{normalize_path, project_id};
use crate::types::{Project, Session, SessionSource};

/// Timestamps below this magnitude are Unix seconds, the rest milliseconds.
pub const SECONDS_THRESHOLD: i64 = 10_000_000_000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHistoryLine {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    display: Option<String>,
    #[serde(default)]
    timestamp: Option<serde_json::Number>,
    #[serde(default)]
    project: Option<String>,
}

/// A validated history log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub session_id: String,
    pub display: String,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub project: String,
}

/// Result of a full pass over the log.
#[derive(Debug, Clone, Default)]
pub struct HistoryLoad {
    pub sessions: HashMap<String, Session>,
    pub projects: HashMap<String, Project>,
    /// Byte offset just past the last folded line.
    pub position: u64,
}

/// Result of an incremental pass over the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncrementalLoad {
    pub new_position: u64,
    /// Sessions touched by the pass.
    pub affected: HashSet<String>,
    /// The log shrank below the stored offset and was reloaded from scratch.
    pub full_reload: bool,
}

/// Scale a raw log timestamp to Unix milliseconds.
pub fn normalize_timestamp(raw: i64) -> i64 {
    if raw.abs() < SECONDS_THRESHOLD {
        raw.saturating_mul(1000)
    } else {
        raw
    }
}

fn number_to_millis(number: &serde_json::Number) -> Option<i64> {
    if let Some(raw) = number.as_i64() {
        return Some(normalize_timestamp(raw));
    }
    let raw = number.as_f64()?;
    if !raw.is_finite() {
        return None;
    }
    if raw.abs() < SECONDS_THRESHOLD as f64 {
        Some((raw * 1000.0).round() as i64)
    } else {
        Some(raw as i64)
    }
}

/// Parse one log line. Returns `None` for anything that cannot be folded.
pub fn parse_history_line(line: &str) -> Option<HistoryEntry> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let raw: RawHistoryLine = match serde_json::from_str(line) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(error = %e, "Skipping malformed history line");
            return None;
        }
    };

    let session_id = raw.session_id.filter(|id| !id.trim().is_empty())?;
    let timestamp = raw.timestamp.as_ref().and_then(number_to_millis)?;

    Some(HistoryEntry {
        session_id,
        display: raw.display.unwrap_or_default(),
        timestamp,
        project: raw.project.unwrap_or_default(),
    })
}

/// Fold one entry into the session map, creating the session on first sight.
///
/// The project path is fixed by the first entry seen for a session. A
/// session discovered from its transcript before any log line is handed over
/// to the log on its first entry: its transcript-derived inputs and project
/// are replaced, so the result matches a rebuild that saw the log first.
pub fn fold_entry(sessions: &mut HashMap<String, Session>, entry: HistoryEntry) {
    match sessions.get_mut(&entry.session_id) {
        Some(session) => {
            if session.source == SessionSource::Transcript {
                adopt_into_log(session, &entry.project);
            }
            session.push_input(entry.display, entry.timestamp);
        }
        None => {
            let mut session = Session::new(entry.session_id.clone(), &entry.project, entry.timestamp);
            session.push_input(entry.display, entry.timestamp);
            sessions.insert(entry.session_id, session);
        }
    }
}

fn adopt_into_log(session: &mut Session, project: &str) {
    let project = normalize_path(project);
    session.source = SessionSource::Log;
    session.inputs.clear();
    session.input_count = 0;
    session.project_id = project_id(&project);
    session.project_path = project;
}

/// Recount every project from the sessions currently present.
///
/// Counts are rebuilt rather than adjusted so repeated partial updates cannot
/// drift. With `prune`, projects left without sessions are removed.
pub fn recompute_projects(
    sessions: &HashMap<String, Session>,
    projects: &mut HashMap<String, Project>,
    prune: bool,
) {
    for project in projects.values_mut() {
        project.session_count = 0;
        project.last_active = 0;
    }

    for session in sessions.values() {
        if session.project_path.is_empty() {
            continue;
        }
        let project = projects
            .entry(session.project_path.clone())
            .or_insert_with(|| Project::new(&session.project_path));
        project.session_count += 1;
        project.last_active = project.last_active.max(session.updated_at);
    }

    if prune {
        projects.retain(|_, project| project.session_count > 0);
    }
}

/// Fold the lines in `[start, end)` and return the offset just past the last
/// folded line.
///
/// A trailing fragment without a newline is only consumed if it parses; a
/// writer caught mid-append leaves it for the next pass.
async fn fold_range(
    path: &Path,
    start: u64,
    end: u64,
    sessions: &mut HashMap<String, Session>,
    affected: &mut HashSet<String>,
) -> std::io::Result<u64> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(start)).await?;
    let mut reader = BufReader::new(file.take(end.saturating_sub(start)));

    let mut position = start;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf).await?;
        if read == 0 {
            break;
        }

        let complete = buf.last() == Some(&b'\n');
        let text = String::from_utf8_lossy(&buf);
        match parse_history_line(&text) {
            Some(entry) => {
                affected.insert(entry.session_id.clone());
                fold_entry(sessions, entry);
                position += read as u64;
            }
            None if complete => position += read as u64,
            None => break,
        }
    }

    Ok(position)
}

async fn log_size(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Some(metadata.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "History log does not exist");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot stat history log");
            None
        }
    }
}

/// Full pass over the log. A missing or unreadable log yields an empty load.
pub async fn load_history(path: &Path) -> HistoryLoad {
    let mut load = HistoryLoad::default();
    let Some(size) = log_size(path).await else {
        return load;
    };

    let mut affected = HashSet::new();
    match fold_range(path, 0, size, &mut load.sessions, &mut affected).await {
        Ok(position) => load.position = position,
        Err(e) => warn!(path = %path.display(), error = %e, "History log read failed; using partial result"),
    }

    for session in load.sessions.values_mut() {
        session.sort_inputs();
    }
    recompute_projects(&load.sessions, &mut load.projects, false);
    load
}

/// Fold only the bytes appended since `last_position`.
///
/// Sessions not mentioned in the new range are left untouched. If the log is
/// now shorter than `last_position` it was truncated or replaced, and the maps
/// are rebuilt from a full pass.
pub async fn load_history_incremental(
    path: &Path,
    last_position: u64,
    sessions: &mut HashMap<String, Session>,
    projects: &mut HashMap<String, Project>,
) -> IncrementalLoad {
    let size = log_size(path).await.unwrap_or(0);

    if last_position > size {
        debug!(
            path = %path.display(),
            last_position,
            size,
            "History log shrank; reloading in full"
        );
        let full = load_history(path).await;
        *sessions = full.sessions;
        *projects = full.projects;
        return IncrementalLoad {
            new_position: full.position,
            affected: sessions.keys().cloned().collect(),
            full_reload: true,
        };
    }

    let mut outcome = IncrementalLoad {
        new_position: last_position,
        ..Default::default()
    };
    if last_position == size {
        return outcome;
    }

    match fold_range(path, last_position, size, sessions, &mut outcome.affected).await {
        Ok(position) => outcome.new_position = position,
        Err(e) => warn!(path = %path.display(), error = %e, "Incremental history read failed"),
    }

    for id in &outcome.affected {
        if let Some(session) = sessions.get_mut(id) {
            session.sort_inputs();
        }
    }
    recompute_projects(sessions, projects, true);
    outcome
}
