//! Authoritative in-memory index.
//!
//! Readers clone an `Arc<IndexSnapshot>` and work on it without holding any
//! lock; writers build a complete new snapshot and swap the reference. A
//! reader therefore sees either the state before a mutation or after it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::scanner::FileCache;
use crate::types::{CacheStats, Project, Session};

/// Immutable view of the index at one point in time.
#[derive(Debug, Clone, Default)]
pub struct IndexSnapshot {
    pub sessions: HashMap<String, Session>,
    /// Keyed by normalized project path.
    pub projects: HashMap<String, Project>,
    pub files: FileCache,
    /// History log mtime (Unix ms) when this snapshot was built.
    pub watermark: Option<i64>,
    /// Bytes of the history log already folded in.
    pub history_position: u64,
}

impl IndexSnapshot {
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entity_count: self.sessions.len(),
            container_count: self.projects.len(),
            watermark: self.watermark,
        }
    }
}

/// Holder of the current snapshot plus the explicit invalidation flag.
#[derive(Debug, Default)]
pub struct IndexCache {
    current: RwLock<Arc<IndexSnapshot>>,
    invalidated: AtomicBool,
}

impl IndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<IndexSnapshot> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Swap in a fully built snapshot and clear the invalidation flag.
    pub fn replace(&self, snapshot: IndexSnapshot) {
        let snapshot = Arc::new(snapshot);
        match self.current.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
        self.invalidated.store(false, Ordering::Release);
    }

    /// Force the next load to rebuild from scratch. The current snapshot
    /// keeps serving reads until then.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::Release);
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// A snapshot is reusable when it is populated, was not invalidated, and
    /// the log has not been modified after it was built.
    pub fn is_valid(&self, log_mtime: Option<i64>) -> bool {
        if self.is_invalidated() {
            return false;
        }
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return false;
        }
        match (log_mtime, snapshot.watermark) {
            (Some(mtime), Some(watermark)) => mtime <= watermark,
            (None, _) => true,
            (Some(_), None) => false,
        }
    }

    pub fn stats(&self) -> CacheStats {
        self.snapshot().stats()
    }
}
