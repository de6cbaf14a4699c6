//! In-process event bus.
//!
//! Each listener owns a bounded queue drained by its own task, so a slow or
//! failing listener never delays `emit` or other listeners. Events reach a
//! given listener in emission order. When a listener's queue is full the
//! event is dropped for that listener only.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use super::events::{ChangeEvent, ChangeKind};

/// Per-listener queue capacity.
pub const LISTENER_QUEUE_CAPACITY: usize = 1024;

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct ListenerSlot {
    id: ListenerId,
    tx: mpsc::Sender<ChangeEvent>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct BusInner {
    listeners: Mutex<HashMap<ChangeKind, Vec<ListenerSlot>>>,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

/// Cheap-to-clone handle to one bus. Constructed explicitly and injected.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked with unknown payload".to_string()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `kind`. Must be called inside a tokio runtime.
    pub fn on<F, Fut>(&self, kind: ChangeKind, listener: F) -> ListenerId
    where
        F: Fn(ChangeEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = mpsc::channel::<ChangeEvent>(LISTENER_QUEUE_CAPACITY);

        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let entity = event.entity_id.clone();
                match AssertUnwindSafe(async { listener(event).await })
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(kind = %kind, entity_id = %entity, error = %e, "Event listener failed");
                    }
                    Err(payload) => {
                        error!(
                            kind = %kind,
                            entity_id = %entity,
                            panic = %panic_message(payload.as_ref()),
                            "Event listener panicked"
                        );
                    }
                }
            }
        });

        let mut listeners = self.lock_listeners();
        listeners
            .entry(kind)
            .or_default()
            .push(ListenerSlot { id, tx, task });
        id
    }

    /// Unregister a listener. Events already queued for it are still handled.
    pub fn off(&self, kind: ChangeKind, id: ListenerId) -> bool {
        let mut listeners = self.lock_listeners();
        let Some(slots) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = slots.len();
        slots.retain(|slot| slot.id != id);
        let removed = slots.len() != before;
        if slots.is_empty() {
            listeners.remove(&kind);
        }
        removed
    }

    /// Queue `event` for every listener of its kind. Never waits.
    pub fn emit(&self, event: ChangeEvent) {
        let listeners = self.lock_listeners();
        let Some(slots) = listeners.get(&event.kind) else {
            return;
        };

        for slot in slots {
            match slot.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let count = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    metrics::counter!("event_bus_dropped_total", "kind" => event.kind.as_str()).increment(1);
                    if count == 1 || count % 100 == 0 {
                        warn!(
                            kind = %event.kind,
                            dropped_total = count,
                            "Listener queue full; event dropped"
                        );
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!(kind = %event.kind, "Listener task is gone; event not delivered");
                }
            }
        }
    }

    pub fn listener_count(&self, kind: ChangeKind) -> usize {
        self.lock_listeners().get(&kind).map_or(0, Vec::len)
    }

    /// Events dropped because a listener queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, HashMap<ChangeKind, Vec<ListenerSlot>>> {
        match self.inner.listeners.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        let listeners = match self.listeners.get_mut() {
            Ok(listeners) => listeners,
            Err(poisoned) => poisoned.into_inner(),
        };
        for slot in listeners.values().flatten() {
            slot.task.abort();
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self.lock_listeners();
        let counts: HashMap<ChangeKind, usize> =
            listeners.iter().map(|(kind, slots)| (*kind, slots.len())).collect();
        f.debug_struct("EventBus")
            .field("listeners", &counts)
            .field("dropped", &self.dropped_events())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn event(kind: ChangeKind, entity: &str) -> ChangeEvent {
        ChangeEvent::new(kind, "-work-app", entity)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(ChangeEvent) -> futures_util::future::Ready<anyhow::Result<()>> + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = move |event: ChangeEvent| {
            sink.lock().unwrap().push(event.entity_id);
            futures_util::future::ready(Ok(()))
        };
        (seen, listener)
    }

    #[tokio::test]
    async fn test_events_arrive_in_emission_order() {
        let bus = EventBus::new();
        let (seen, listener) = recorder();
        bus.on(ChangeKind::SessionChanged, listener);

        for i in 0..200 {
            bus.emit(event(ChangeKind::SessionChanged, &i.to_string()));
        }

        wait_until(|| seen.lock().unwrap().len() == 200).await;
        let expected: Vec<String> = (0..200).map(|i| i.to_string()).collect();
        assert_eq!(*seen.lock().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_listeners_only_receive_their_kind() {
        let bus = EventBus::new();
        let (seen, listener) = recorder();
        bus.on(ChangeKind::SessionListChanged, listener);

        bus.emit(event(ChangeKind::SessionChanged, "ignored"));
        bus.emit(event(ChangeKind::SessionListChanged, "wanted"));

        wait_until(|| !seen.lock().unwrap().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["wanted".to_string()]);
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_affect_others() {
        let bus = EventBus::new();
        let attempts = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&attempts);
        bus.on(ChangeKind::SessionChanged, move |event: ChangeEvent| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if event.entity_id == "boom" {
                    panic!("listener exploded");
                }
                Err::<(), _>(anyhow::anyhow!("always fails"))
            }
        });
        let (seen, listener) = recorder();
        bus.on(ChangeKind::SessionChanged, listener);

        bus.emit(event(ChangeKind::SessionChanged, "boom"));
        bus.emit(event(ChangeKind::SessionChanged, "after"));

        wait_until(|| seen.lock().unwrap().len() == 2).await;
        // The panicking listener keeps consuming its queue.
        wait_until(|| attempts.load(Ordering::SeqCst) == 2).await;
        assert_eq!(*seen.lock().unwrap(), vec!["boom".to_string(), "after".to_string()]);
    }

    #[tokio::test]
    async fn test_off_stops_delivery() {
        let bus = EventBus::new();
        let (seen, listener) = recorder();
        let id = bus.on(ChangeKind::SessionChanged, listener);
        assert_eq!(bus.listener_count(ChangeKind::SessionChanged), 1);

        assert!(bus.off(ChangeKind::SessionChanged, id));
        assert!(!bus.off(ChangeKind::SessionChanged, id));
        assert_eq!(bus.listener_count(ChangeKind::SessionChanged), 0);

        bus.emit(event(ChangeKind::SessionChanged, "late"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest() {
        let bus = EventBus::new();
        let gate = Arc::new(tokio::sync::Notify::new());
        let release = Arc::clone(&gate);
        bus.on(ChangeKind::SessionChanged, move |_event: ChangeEvent| {
            let release = Arc::clone(&release);
            async move {
                release.notified().await;
                Ok::<(), anyhow::Error>(())
            }
        });

        let total = LISTENER_QUEUE_CAPACITY + 50;
        for i in 0..total {
            bus.emit(event(ChangeKind::SessionChanged, &i.to_string()));
        }

        // One event may already be held by the listener task.
        let dropped = bus.dropped_events() as usize;
        assert!(dropped >= total - LISTENER_QUEUE_CAPACITY - 1, "dropped {dropped}");
        gate.notify_waiters();
    }
}
