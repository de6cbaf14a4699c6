//! Native directory watcher for the projects tree.
//!
//! ## Path classification
//!
//! ```text
//! <root>/
//! ├── {container}/
//! │   ├── {sessionId}.jsonl                     ← session
//! │   ├── agent-{agentId}.jsonl                 ← derived session
//! │   └── {sessionId}/
//! │       ├── subagents/
//! │       │   └── agent-{agentId}.jsonl         ← derived session
//! │       └── tool-results/…                    ← ignored
//! ```
//!
//! Derived paths are checked first, so `agent-*.jsonl` never counts as a
//! session. Anything else is ignored.
//!
//! ## Pipeline
//!
//! The notify callback runs on its own thread and only forwards raw paths
//! into a bounded channel (`try_send`; overflow is counted and logged). A
//! tokio task classifies them and debounces per `(container, entity, kind)`
//! in a `DelayQueue`: a repeat before the deadline pushes the deadline back.
//! Expired keys are turned into [`ChangeEvent`]s on the bus.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, error, info, warn};

use super::bus::EventBus;
use super::events::{ChangeEvent, ChangeKind};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// Raw notifications buffered between the notify thread and the dispatcher.
const RAW_CHANNEL_CAPACITY: usize = 4096;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("Watch root does not exist: {0}")]
    RootMissing(PathBuf),

    #[error("Watcher is already running on {0}")]
    AlreadyWatching(PathBuf),

    #[error("Native watcher error: {0}")]
    Notify(#[from] notify::Error),
}

/// A classified path under the watch root. Also the debounce key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchKey {
    Session { container: String, session: String },
    Agent { container: String, agent: String },
}

impl WatchKey {
    /// Events emitted when this key's debounce window closes.
    pub fn events(&self) -> Vec<ChangeEvent> {
        match self {
            WatchKey::Session { container, session } => vec![
                ChangeEvent::new(ChangeKind::SessionChanged, container, session),
                ChangeEvent::new(ChangeKind::SessionListChanged, container, session),
            ],
            WatchKey::Agent { container, agent } => {
                vec![ChangeEvent::new(ChangeKind::AgentSessionChanged, container, agent)]
            }
        }
    }
}

fn jsonl_stem(name: &str) -> Option<&str> {
    name.strip_suffix(".jsonl").filter(|stem| !stem.is_empty())
}

fn agent_id(name: &str) -> Option<&str> {
    jsonl_stem(name)?.strip_prefix("agent-").filter(|id| !id.is_empty())
}

/// Classify `path` relative to the watch `root`.
pub fn classify_path(root: &Path, path: &Path) -> Option<WatchKey> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<&str> = rel
        .components()
        .map(|c| match c {
            Component::Normal(part) => part.to_str(),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;

    match parts.as_slice() {
        [container, file] => {
            if let Some(agent) = agent_id(file) {
                return Some(WatchKey::Agent {
                    container: container.to_string(),
                    agent: agent.to_string(),
                });
            }
            jsonl_stem(file).map(|session| WatchKey::Session {
                container: container.to_string(),
                session: session.to_string(),
            })
        }
        [container, _session, "subagents", file] => agent_id(file).map(|agent| WatchKey::Agent {
            container: container.to_string(),
            agent: agent.to_string(),
        }),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Stopped,
    Watching,
}

struct Running {
    root: PathBuf,
    // Dropping the handle unregisters the native watch.
    _native: RecommendedWatcher,
    raw_tx: mpsc::Sender<PathBuf>,
    dispatcher: JoinHandle<()>,
}

pub struct DirectoryWatcher {
    bus: EventBus,
    debounce: Duration,
    dropped: Arc<AtomicU64>,
    running: Option<Running>,
}

impl DirectoryWatcher {
    pub fn new(bus: EventBus, debounce: Duration) -> Self {
        Self {
            bus,
            debounce,
            dropped: Arc::new(AtomicU64::new(0)),
            running: None,
        }
    }

    pub fn state(&self) -> WatcherState {
        if self.running.is_some() {
            WatcherState::Watching
        } else {
            WatcherState::Stopped
        }
    }

    /// Notifications lost because the raw channel was full.
    pub fn dropped_notifications(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Start watching `root` recursively. Must be called inside a tokio runtime.
    pub fn start(&mut self, root: &Path) -> Result<(), WatcherError> {
        if let Some(running) = &self.running {
            return Err(WatcherError::AlreadyWatching(running.root.clone()));
        }
        if !root.is_dir() {
            return Err(WatcherError::RootMissing(root.to_path_buf()));
        }

        let (raw_tx, raw_rx) = mpsc::channel::<PathBuf>(RAW_CHANNEL_CAPACITY);
        let callback_tx = raw_tx.clone();
        let dropped = Arc::clone(&self.dropped);

        let mut native = notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if !matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        return;
                    }
                    for path in event.paths {
                        if path.extension().map(|ext| ext != "jsonl").unwrap_or(true) {
                            continue;
                        }
                        if callback_tx.try_send(path).is_err() {
                            let count = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                            metrics::counter!("watcher_dropped_notifications_total").increment(1);
                            if count == 1 || count % 100 == 0 {
                                warn!(
                                    dropped_total = count,
                                    "Watcher channel full; notification dropped (next refresh will catch up)"
                                );
                            }
                        }
                    }
                }
                Err(e) => error!("Directory watcher error: {}", e),
            }
        })?;
        native.watch(root, RecursiveMode::Recursive)?;

        let dispatcher = tokio::spawn(dispatch(
            root.to_path_buf(),
            raw_rx,
            self.bus.clone(),
            self.debounce,
        ));

        info!(root = %root.display(), debounce_ms = self.debounce.as_millis() as u64, "Watching projects directory");
        self.running = Some(Running {
            root: root.to_path_buf(),
            _native: native,
            raw_tx,
            dispatcher,
        });
        Ok(())
    }

    /// Stop watching. Pending debounce timers are discarded. Safe to repeat.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.dispatcher.abort();
            info!(root = %running.root.display(), "Stopped watching projects directory");
        }
    }

    /// Inject a raw notification as if the native watcher had reported it.
    /// Returns `false` when stopped or when the channel is full.
    pub fn notify_path(&self, path: &Path) -> bool {
        match &self.running {
            Some(running) => running.raw_tx.try_send(path.to_path_buf()).is_ok(),
            None => false,
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn dispatch(root: PathBuf, mut raw_rx: mpsc::Receiver<PathBuf>, bus: EventBus, debounce: Duration) {
    let mut queue: DelayQueue<WatchKey> = DelayQueue::new();
    let mut pending: HashMap<WatchKey, delay_queue::Key> = HashMap::new();

    loop {
        tokio::select! {
            raw = raw_rx.recv() => {
                let Some(path) = raw else { break };
                let Some(key) = classify_path(&root, &path) else {
                    continue;
                };
                metrics::counter!("watcher_notifications_total").increment(1);
                match pending.get(&key) {
                    Some(timer) => queue.reset(timer, debounce),
                    None => {
                        let timer = queue.insert(key.clone(), debounce);
                        pending.insert(key, timer);
                    }
                }
            }
            Some(expired) = std::future::poll_fn(|cx| queue.poll_expired(cx)) => {
                let key = expired.into_inner();
                pending.remove(&key);
                for event in key.events() {
                    debug!(kind = %event.kind, container = %event.container_id, entity = %event.entity_id, "Emitting change");
                    metrics::counter!("watcher_events_emitted_total", "kind" => event.kind.as_str()).increment(1);
                    bus.emit(event);
                }
            }
        }
    }
}
