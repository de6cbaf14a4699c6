//! Directory scanner for per-session transcript files.
//!
//! Layout: `<root>/<encoded project dir>/<session id>.jsonl`. Only direct
//! children of each project directory are considered. Derived sessions
//! (`agent-*.jsonl`) and nested directories belong to their parent session
//! and are never indexed as sessions of their own.
//!
//! Two modes share one listing pass:
//! - [`scan_full`] builds on top of a fresh history load. Sessions the log
//!   already knows are not opened; orphan transcripts are read once.
//! - [`scan_incremental`] re-reads only files whose `(mtime, size)` stamp
//!   moved, and drops sessions whose file disappeared.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, warn};

use crate::history::recompute_projects;
use crate::paths::resolve_dir_name;
use crate::transcript::{summarize_transcript, TranscriptSummary};
use crate::types::{mtime_millis, FileCacheEntry, Project, Session, SessionSource};

/// Stamp cache keyed by transcript path.
pub type FileCache = HashMap<PathBuf, FileCacheEntry>;

/// A transcript file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptFile {
    pub session_id: String,
    pub path: PathBuf,
    /// Encoded project directory name the file lives in.
    pub dir_name: String,
    pub stamp: FileCacheEntry,
    /// Modification time, used when the file carries no dated record.
    pub mtime_ms: i64,
}

/// What a scan changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Sessions created or updated from a transcript read.
    pub changed: Vec<String>,
    /// Sessions dropped because their transcript vanished.
    pub removed: Vec<String>,
    /// Transcript files seen on disk.
    pub files_seen: usize,
    /// Files opened and parsed during this scan.
    pub files_read: usize,
}

/// True for file names that denote a primary session transcript.
pub fn is_session_file_name(name: &str) -> bool {
    name.ends_with(".jsonl") && !name.starts_with("agent-") && name.len() > ".jsonl".len()
}

/// List every primary transcript under `root`.
///
/// Returns `None` when the root exists but cannot be listed; callers must
/// then not treat missing files as deleted.
pub async fn list_transcripts(root: &Path) -> Option<Vec<TranscriptFile>> {
    let mut projects = match fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(root = %root.display(), "Projects directory does not exist");
            return Some(Vec::new());
        }
        Err(e) => {
            warn!(root = %root.display(), error = %e, "Cannot list projects directory");
            return None;
        }
    };

    let mut found = Vec::new();
    loop {
        let entry = match projects.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(root = %root.display(), error = %e, "Projects directory listing interrupted");
                return None;
            }
        };

        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        let dir_name = entry.file_name().to_string_lossy().to_string();
        if let Err(e) = list_project_dir(&entry.path(), &dir_name, &mut found).await {
            debug!(dir = %entry.path().display(), error = %e, "Skipping unreadable project directory");
        }
    }

    Some(found)
}

async fn list_project_dir(
    dir: &Path,
    dir_name: &str,
    found: &mut Vec<TranscriptFile>,
) -> std::io::Result<()> {
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_session_file_name(&name) {
            continue;
        }

        let path = entry.path();
        // Follows symlinks, so a linked transcript is stamped by its target.
        let metadata = match fs::metadata(&path).await {
            Ok(m) if m.is_file() => m,
            Ok(_) => continue,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Transcript vanished during listing");
                continue;
            }
        };

        found.push(TranscriptFile {
            session_id: name.trim_end_matches(".jsonl").to_string(),
            stamp: FileCacheEntry::from_metadata(&metadata),
            mtime_ms: mtime_millis(&metadata).unwrap_or(0),
            dir_name: dir_name.to_string(),
            path,
        });
    }
    Ok(())
}

/// Read a transcript summary, logging and swallowing failures.
async fn read_summary(file: &TranscriptFile) -> Option<TranscriptSummary> {
    match summarize_transcript(&file.path).await {
        Ok(summary) => Some(summary),
        Err(e) if e.is_transient() => {
            debug!(error = %e, "Transcript vanished or is unreadable; skipping");
            None
        }
        Err(e) => {
            warn!(error = %e, "Failed to read transcript");
            None
        }
    }
}

/// Build a session from a transcript the log does not mention.
async fn session_from_summary(file: &TranscriptFile, summary: TranscriptSummary) -> Session {
    let project_path = match summary.project {
        Some(project) => project,
        None => resolve_dir_name(&file.dir_name).await.full_path,
    };
    let first = summary.first_timestamp.unwrap_or(file.mtime_ms);
    let last = summary.last_timestamp.unwrap_or(file.mtime_ms);

    let mut session = Session::new(file.session_id.clone(), &project_path, first);
    session.observe(last);
    session.input_count = summary.inputs.len();
    session.inputs = summary.inputs;
    session.turn_count = summary.turn_count;
    session.transcript_path = Some(file.path.clone());
    session.source = SessionSource::Transcript;
    session
}

/// Fold a re-read transcript into a session the log owns.
fn refresh_log_session(session: &mut Session, file: &TranscriptFile, summary: &TranscriptSummary) {
    if let Some(first) = summary.first_timestamp {
        session.observe(first);
    }
    if let Some(last) = summary.last_timestamp {
        session.observe(last);
    }
    session.turn_count = session.turn_count.max(summary.turn_count);
    session.transcript_path = Some(file.path.clone());
}

/// Full pass over the projects directory.
///
/// `sessions` and `projects` come from a full history load; `files` is
/// replaced. Sessions already present keep their log-derived data and only
/// gain a `transcript_path` and a stamp.
pub async fn scan_full(
    root: &Path,
    sessions: &mut HashMap<String, Session>,
    projects: &mut HashMap<String, Project>,
    files: &mut FileCache,
) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();
    files.clear();

    let listed = list_transcripts(root).await.unwrap_or_default();
    outcome.files_seen = listed.len();

    for file in listed {
        if let Some(session) = sessions.get_mut(&file.session_id) {
            session.transcript_path = Some(file.path.clone());
            files.insert(file.path.clone(), file.stamp);
            continue;
        }

        let Some(summary) = read_summary(&file).await else {
            continue;
        };
        outcome.files_read += 1;
        files.insert(file.path.clone(), file.stamp);
        outcome.changed.push(file.session_id.clone());
        sessions.insert(file.session_id.clone(), session_from_summary(&file, summary).await);
    }

    recompute_projects(sessions, projects, false);
    debug!(
        root = %root.display(),
        files = outcome.files_seen,
        read = outcome.files_read,
        discovered = outcome.changed.len(),
        "Full transcript scan complete"
    );
    outcome
}

/// Re-read only transcripts whose stamp differs from `files`.
pub async fn scan_incremental(
    root: &Path,
    sessions: &mut HashMap<String, Session>,
    projects: &mut HashMap<String, Project>,
    files: &mut FileCache,
) -> ScanOutcome {
    let mut outcome = ScanOutcome::default();

    let Some(listed) = list_transcripts(root).await else {
        return outcome;
    };
    outcome.files_seen = listed.len();

    let on_disk: HashSet<PathBuf> = listed.iter().map(|f| f.path.clone()).collect();
    let vanished: Vec<PathBuf> = files
        .keys()
        .filter(|path| !on_disk.contains(*path))
        .cloned()
        .collect();
    for path in vanished {
        files.remove(&path);
        let owner = sessions
            .iter()
            .find(|(_, s)| s.transcript_path.as_deref() == Some(path.as_path()))
            .map(|(id, _)| id.clone());
        if let Some(id) = owner {
            debug!(session_id = %id, path = %path.display(), "Transcript removed; dropping session");
            sessions.remove(&id);
            outcome.removed.push(id);
        }
    }

    for file in listed {
        if files.get(&file.path) == Some(&file.stamp) {
            continue;
        }

        let Some(summary) = read_summary(&file).await else {
            continue;
        };
        outcome.files_read += 1;
        files.insert(file.path.clone(), file.stamp);

        match sessions.get_mut(&file.session_id) {
            Some(session) if session.source == SessionSource::Log => {
                refresh_log_session(session, &file, &summary);
            }
            Some(session) => {
                let mut rebuilt = session_from_summary(&file, summary).await;
                rebuilt.observe(session.created_at);
                rebuilt.turn_count = rebuilt.turn_count.max(session.turn_count);
                *session = rebuilt;
            }
            None => {
                sessions.insert(file.session_id.clone(), session_from_summary(&file, summary).await);
            }
        }
        outcome.changed.push(file.session_id);
    }

    recompute_projects(sessions, projects, true);
    if !outcome.changed.is_empty() || !outcome.removed.is_empty() {
        debug!(
            root = %root.display(),
            changed = outcome.changed.len(),
            removed = outcome.removed.len(),
            "Incremental transcript scan applied changes"
        );
    }
    outcome
}
