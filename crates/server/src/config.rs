//! Command-line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use history_index_core::paths::{default_history_path, default_projects_dir};

/// Default port for the server.
pub const DEFAULT_PORT: u16 = 47893;

#[derive(Debug, Clone, Parser)]
#[command(name = "history-index")]
#[command(version)]
#[command(about = "Serve an incremental index of conversation history with live change notifications", long_about = None)]
pub struct Config {
    /// Port to listen on (loopback only).
    #[arg(long, env = "HISTORY_INDEX_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Append-only history log [default: ~/.claude/history.jsonl]
    #[arg(long, env = "HISTORY_INDEX_LOG")]
    pub history_path: Option<PathBuf>,

    /// Root of per-project transcript folders [default: ~/.claude/projects]
    #[arg(long, env = "HISTORY_INDEX_ROOT")]
    pub projects_dir: Option<PathBuf>,

    /// Quiet period before a burst of file changes is reported.
    #[arg(long, default_value_t = 100)]
    pub debounce_ms: u64,

    /// Interval between heartbeats on the push stream.
    #[arg(long, default_value_t = 15)]
    pub heartbeat_secs: u64,

    /// Skip the directory watcher. Reads still pick up history log appends,
    /// but transcript edits and new transcript files are only seen after a
    /// restart.
    #[arg(long)]
    pub no_watch: bool,
}

/// Configuration with every default applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub port: u16,
    pub history_path: PathBuf,
    pub projects_dir: PathBuf,
    pub debounce: Duration,
    pub heartbeat: Duration,
    pub watch: bool,
}

impl Config {
    pub fn resolve(self) -> Result<ResolvedConfig> {
        let history_path = match self.history_path {
            Some(path) => path,
            None => default_history_path().context("cannot locate home directory for the history log")?,
        };
        let projects_dir = match self.projects_dir {
            Some(path) => path,
            None => default_projects_dir().context("cannot locate home directory for the projects folder")?,
        };

        Ok(ResolvedConfig {
            port: self.port,
            history_path,
            projects_dir,
            debounce: Duration::from_millis(self.debounce_ms),
            heartbeat: Duration::from_secs(self.heartbeat_secs.max(1)),
            watch: !self.no_watch,
        })
    }
}
