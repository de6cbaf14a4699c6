//! Keeps the index current as watcher events arrive, and republishes each
//! event only once the index reflects it.
//!
//! ```text
//! watcher ──► source bus ──► refresh ──► relay bus ──► gateway
//! ```
//!
//! Clients that re-fetch on a notification therefore never read a snapshot
//! older than the change they were told about.

use std::sync::Arc;
use std::time::Instant;

use history_index_core::SessionRepository;
use tracing::trace;

use super::bus::{EventBus, ListenerId};
use super::events::{ChangeEvent, ChangeKind};
use crate::metrics::record_refresh;

/// Kinds that trigger an index refresh.
pub const REFRESH_KINDS: [ChangeKind; 2] = [ChangeKind::SessionChanged, ChangeKind::SessionListChanged];

/// Listen on `source` for every kind. Kinds in [`REFRESH_KINDS`] refresh
/// `repository` before being re-emitted on `relay`; the rest are forwarded
/// as they are.
///
/// Each kind gets its own listener task; refreshes themselves are serialized
/// inside the repository.
pub fn register_refresh(
    source: &EventBus,
    repository: Arc<SessionRepository>,
    relay: EventBus,
) -> Vec<(ChangeKind, ListenerId)> {
    ChangeKind::ALL
        .into_iter()
        .map(|kind| {
            let repository = Arc::clone(&repository);
            let relay = relay.clone();
            let refreshes = REFRESH_KINDS.contains(&kind);
            let id = source.on(kind, move |event: ChangeEvent| {
                let repository = Arc::clone(&repository);
                let relay = relay.clone();
                async move {
                    if refreshes {
                        trace!(trigger = %event.kind, entity_id = %event.entity_id, "Refreshing index");
                        let start = Instant::now();
                        let outcome = repository.refresh().await;
                        record_refresh(
                            start.elapsed(),
                            outcome.changed.len(),
                            outcome.removed.len(),
                            outcome.full_reload,
                        );
                    }
                    relay.emit(event);
                    Ok::<(), anyhow::Error>(())
                }
            });
            (kind, id)
        })
        .collect()
}
