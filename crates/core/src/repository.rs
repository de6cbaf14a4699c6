//! Session repository: builds, refreshes and serves the index.
//!
//! Every mutation runs under one async mutex and ends with a snapshot swap,
//! so builds never interleave and readers never observe a half-built index.

use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{IndexCache, IndexSnapshot};
use crate::error::IndexError;
use crate::history::{load_history, load_history_incremental, recompute_projects};
use crate::paths::normalize_path;
use crate::scanner::{scan_full, scan_incremental, FileCache};
use crate::tail::read_recent_turns;
use crate::types::{mtime_millis, CacheStats, Project, Session};

/// Result of a successful [`SessionRepository::delete_session`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub transcript_deleted: bool,
    pub derived_dir_deleted: bool,
    pub log_lines_removed: usize,
}

/// What a refresh changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshOutcome {
    /// Sessions touched by new log lines or re-read transcripts, sorted.
    pub changed: Vec<String>,
    /// Sessions dropped because their transcript vanished, sorted.
    pub removed: Vec<String>,
    /// The index was rebuilt from scratch.
    pub full_reload: bool,
}

impl RefreshOutcome {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty() && !self.full_reload
    }
}

pub struct SessionRepository {
    history_path: PathBuf,
    projects_dir: PathBuf,
    cache: IndexCache,
    write_lock: Mutex<()>,
}

impl SessionRepository {
    pub fn new(history_path: impl Into<PathBuf>, projects_dir: impl Into<PathBuf>) -> Self {
        Self {
            history_path: history_path.into(),
            projects_dir: projects_dir.into(),
            cache: IndexCache::new(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn history_path(&self) -> &Path {
        &self.history_path
    }

    pub fn projects_dir(&self) -> &Path {
        &self.projects_dir
    }

    /// Current snapshot, without any validity check.
    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        self.cache.snapshot()
    }

    /// Force the next [`load_all`](Self::load_all) to rebuild from scratch.
    pub fn invalidate(&self) {
        self.cache.invalidate();
    }

    /// True when [`load_all`](Self::load_all) would return the current
    /// snapshot without rebuilding.
    pub async fn is_current(&self) -> bool {
        self.cache.is_valid(self.log_mtime().await)
    }

    async fn log_mtime(&self) -> Option<i64> {
        tokio::fs::metadata(&self.history_path)
            .await
            .ok()
            .and_then(|m| mtime_millis(&m))
    }

    /// Return a snapshot consistent with the log on disk.
    ///
    /// A valid cache costs one `stat`. A stale but populated cache is brought
    /// up to date incrementally; an empty or invalidated one is rebuilt.
    pub async fn load_all(&self) -> Arc<IndexSnapshot> {
        let log_mtime = self.log_mtime().await;
        if self.cache.is_valid(log_mtime) {
            return self.cache.snapshot();
        }

        let _guard = self.write_lock.lock().await;
        let log_mtime = self.log_mtime().await;
        if self.cache.is_valid(log_mtime) {
            return self.cache.snapshot();
        }

        let current = self.cache.snapshot();
        let next = if !current.is_empty() && !self.cache.is_invalidated() {
            self.build_incremental(&current, log_mtime).await.0
        } else {
            self.build_full(log_mtime).await
        };
        self.cache.replace(next);
        self.cache.snapshot()
    }

    /// Fold log appends and transcript changes into the index.
    pub async fn refresh(&self) -> RefreshOutcome {
        let _guard = self.write_lock.lock().await;
        let log_mtime = self.log_mtime().await;
        let current = self.cache.snapshot();

        if current.is_empty() || self.cache.is_invalidated() {
            let next = self.build_full(log_mtime).await;
            let mut changed: Vec<String> = next.sessions.keys().cloned().collect();
            changed.sort();
            self.cache.replace(next);
            return RefreshOutcome {
                changed,
                removed: Vec::new(),
                full_reload: true,
            };
        }

        let (next, outcome) = self.build_incremental(&current, log_mtime).await;
        self.cache.replace(next);
        outcome
    }

    async fn build_full(&self, log_mtime: Option<i64>) -> IndexSnapshot {
        let history = load_history(&self.history_path).await;
        let mut snapshot = IndexSnapshot {
            sessions: history.sessions,
            projects: history.projects,
            files: FileCache::new(),
            watermark: log_mtime,
            history_position: history.position,
        };
        scan_full(
            &self.projects_dir,
            &mut snapshot.sessions,
            &mut snapshot.projects,
            &mut snapshot.files,
        )
        .await;

        info!(
            sessions = snapshot.sessions.len(),
            projects = snapshot.projects.len(),
            "Built index from scratch"
        );
        snapshot
    }

    async fn build_incremental(
        &self,
        base: &IndexSnapshot,
        log_mtime: Option<i64>,
    ) -> (IndexSnapshot, RefreshOutcome) {
        let mut next = base.clone();
        next.watermark = log_mtime;

        let history = load_history_incremental(
            &self.history_path,
            next.history_position,
            &mut next.sessions,
            &mut next.projects,
        )
        .await;
        next.history_position = history.new_position;

        let scan = if history.full_reload {
            // Orphan transcripts were discarded with the old maps.
            scan_full(&self.projects_dir, &mut next.sessions, &mut next.projects, &mut next.files).await
        } else {
            scan_incremental(&self.projects_dir, &mut next.sessions, &mut next.projects, &mut next.files).await
        };

        let mut changed: Vec<String> = history.affected.into_iter().chain(scan.changed).collect();
        changed.sort();
        changed.dedup();
        let mut removed = scan.removed;
        removed.sort();
        changed.retain(|id| removed.binary_search(id).is_err());

        debug!(
            changed = changed.len(),
            removed = removed.len(),
            full_reload = history.full_reload,
            position = next.history_position,
            "Applied incremental index update"
        );
        let outcome = RefreshOutcome {
            changed,
            removed,
            full_reload: history.full_reload,
        };
        (next, outcome)
    }

    /// All sessions, most recently active first.
    pub fn list_sessions(&self) -> Vec<Session> {
        sorted_by_activity(self.snapshot().sessions.values().cloned().collect())
    }

    pub fn get_session(&self, id: &str) -> Option<Session> {
        self.snapshot().sessions.get(id).cloned()
    }

    /// Sessions of one project path, most recently active first.
    pub fn list_by_container(&self, path: &str) -> Vec<Session> {
        let path = normalize_path(path);
        let snapshot = self.snapshot();
        sorted_by_activity(
            snapshot
                .sessions
                .values()
                .filter(|s| s.project_path == path)
                .cloned()
                .collect(),
        )
    }

    /// Sessions with at least one input containing `query`, ignoring case.
    pub fn search(&self, query: &str) -> Vec<Session> {
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return self.list_sessions();
        }
        let snapshot = self.snapshot();
        sorted_by_activity(
            snapshot
                .sessions
                .values()
                .filter(|s| {
                    s.inputs
                        .iter()
                        .any(|input| input.display.to_lowercase().contains(&needle))
                })
                .cloned()
                .collect(),
        )
    }

    /// Projects, most recently active first.
    pub fn list_containers(&self) -> Vec<Project> {
        let mut projects: Vec<Project> = self.snapshot().projects.values().cloned().collect();
        projects.sort_by(|a, b| b.last_active.cmp(&a.last_active).then_with(|| a.path.cmp(&b.path)));
        projects
    }

    pub fn get_cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// A session with its chat turns, capped to the last `limit` if given.
    ///
    /// Returns `None` for unknown ids. A missing or unreadable transcript
    /// yields the session with no turns.
    pub async fn get_session_with_transcript(&self, id: &str, limit: Option<usize>) -> Option<Session> {
        let mut session = self.get_session(id)?;
        let Some(path) = session.transcript_path.clone() else {
            return Some(session);
        };

        match read_recent_turns(&path, limit).await {
            Ok(turns) => session.turns = turns,
            Err(e) if e.is_transient() => {
                debug!(session_id = %id, error = %e, "Transcript is gone or unreadable");
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to read transcript");
            }
        }
        Some(session)
    }

    /// Delete a session's transcript, its derived directory, and its log lines.
    pub async fn delete_session(&self, id: &str) -> Result<DeleteOutcome, IndexError> {
        let _guard = self.write_lock.lock().await;
        let current = self.cache.snapshot();
        let session = current
            .sessions
            .get(id)
            .ok_or_else(|| IndexError::SessionNotFound(id.to_string()))?;

        let mut outcome = DeleteOutcome::default();
        if let Some(transcript) = &session.transcript_path {
            match tokio::fs::remove_file(transcript).await {
                Ok(()) => outcome.transcript_deleted = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(IndexError::RemoveTranscript {
                        path: transcript.clone(),
                        source,
                    })
                }
            }

            if let Some(parent) = transcript.parent() {
                let derived = parent.join(id);
                match tokio::fs::remove_dir_all(&derived).await {
                    Ok(()) => outcome.derived_dir_deleted = true,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(path = %derived.display(), error = %e, "Failed to remove derived session directory"),
                }
            }
        }

        let log = self.history_path.clone();
        let target = id.to_string();
        let rewritten = tokio::task::spawn_blocking(move || rewrite_log_without(&log, &target)).await;
        let removed_lines = match rewritten {
            Ok(Ok(count)) => count,
            Ok(Err(source)) => {
                if outcome.transcript_deleted {
                    self.cache.invalidate();
                }
                return Err(IndexError::RewriteLog {
                    path: self.history_path.clone(),
                    source,
                });
            }
            Err(e) => {
                if outcome.transcript_deleted {
                    self.cache.invalidate();
                }
                return Err(e.into());
            }
        };
        outcome.log_lines_removed = removed_lines;

        let mut next = IndexSnapshot::clone(&current);
        if let Some(removed) = next.sessions.remove(id) {
            if let Some(path) = removed.transcript_path {
                next.files.remove(&path);
            }
        }
        recompute_projects(&next.sessions, &mut next.projects, true);
        self.cache.replace(next);
        // The log was rewritten in place; its fold offset is no longer valid.
        self.cache.invalidate();

        info!(
            session_id = %id,
            transcript_deleted = outcome.transcript_deleted,
            log_lines_removed = outcome.log_lines_removed,
            "Deleted session"
        );
        Ok(outcome)
    }
}

fn sorted_by_activity(mut sessions: Vec<Session>) -> Vec<Session> {
    sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
    sessions
}

#[derive(Deserialize)]
struct SessionIdOnly {
    #[serde(rename = "sessionId", default)]
    session_id: Option<String>,
}

/// Rewrite the log without lines whose `sessionId` equals `id`.
///
/// Lines that do not parse are kept verbatim. The new content goes to a temp
/// file in the same directory, then replaces the log by rename. Returns the
/// number of lines removed; the log is left untouched when that is zero.
fn rewrite_log_without(path: &Path, id: &str) -> std::io::Result<usize> {
    let file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    let mut removed = 0usize;
    {
        let mut reader = BufReader::new(file);
        let mut writer = BufWriter::new(temp.as_file_mut());
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            let matches = serde_json::from_slice::<SessionIdOnly>(trim_newline(&line))
                .ok()
                .and_then(|parsed| parsed.session_id)
                .is_some_and(|sid| sid == id);
            if matches {
                removed += 1;
            } else {
                writer.write_all(&line)?;
            }
        }
        writer.flush()?;
    }

    if removed == 0 {
        return Ok(0);
    }
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(removed)
}

fn trim_newline(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}
