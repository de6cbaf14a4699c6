//! Change fan-out gateway.
//!
//! Push-stream clients attach here. The gateway holds its bus listeners and
//! its heartbeat task only while at least one subscriber is connected: the
//! first `connect` sets them up, the last disconnect tears them down.
//!
//! Messages carry a ULID `id` that is unique and increases with time, but a
//! reconnecting client cannot resume from it. Clients re-fetch state after
//! a reconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::bus::{EventBus, ListenerId};
use super::events::{ChangeEvent, ChangeKind};

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

/// Messages buffered per subscriber before it is considered too slow.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// One message on the push stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayMessage {
    pub id: String,
    pub event: String,
    pub data: serde_json::Value,
    pub server_time: DateTime<Utc>,
}

struct GatewayState {
    subscribers: HashMap<u64, mpsc::Sender<GatewayMessage>>,
    next_subscriber: u64,
    heartbeat: Option<JoinHandle<()>>,
    upstream: Vec<(ChangeKind, ListenerId)>,
    ids: ulid::Generator,
}

struct GatewayInner {
    bus: EventBus,
    heartbeat_every: Duration,
    state: Mutex<GatewayState>,
}

/// Cheap-to-clone handle to the gateway.
#[derive(Clone)]
pub struct ChangeGateway {
    inner: Arc<GatewayInner>,
}

/// A connected client. Dropping it disconnects.
pub struct Subscriber {
    id: u64,
    rx: mpsc::Receiver<GatewayMessage>,
    gateway: Arc<GatewayInner>,
}

impl GatewayState {
    fn message(&mut self, event: &str, data: serde_json::Value) -> GatewayMessage {
        let id = self.ids.generate().unwrap_or_else(|_| ulid::Ulid::new());
        GatewayMessage {
            id: id.to_string(),
            event: event.to_string(),
            data,
            server_time: Utc::now(),
        }
    }
}

impl GatewayInner {
    fn lock(&self) -> MutexGuard<'_, GatewayState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn broadcast(&self, event: &str, data: serde_json::Value) -> usize {
        let mut state = self.lock();
        if state.subscribers.is_empty() {
            return 0;
        }
        let message = state.message(event, data);

        let mut failed = Vec::new();
        for (id, tx) in &state.subscribers {
            if tx.try_send(message.clone()).is_err() {
                failed.push(*id);
            }
        }
        for id in &failed {
            state.subscribers.remove(id);
            debug!(subscriber = id, "Removed subscriber after failed delivery");
        }
        let delivered = state.subscribers.len();
        if !failed.is_empty() {
            self.after_removal(&mut state);
        }
        delivered
    }

    fn disconnect(&self, id: u64) {
        let mut state = self.lock();
        if state.subscribers.remove(&id).is_some() {
            debug!(subscriber = id, "Subscriber disconnected");
            self.after_removal(&mut state);
        }
    }

    fn after_removal(&self, state: &mut GatewayState) {
        metrics::gauge!("gateway_subscribers").set(state.subscribers.len() as f64);
        if !state.subscribers.is_empty() {
            return;
        }
        if let Some(task) = state.heartbeat.take() {
            task.abort();
        }
        for (kind, id) in state.upstream.drain(..) {
            self.bus.off(kind, id);
        }
        info!("Last subscriber left; upstream subscription released");
    }
}

fn start_upstream(inner: &Arc<GatewayInner>, state: &mut GatewayState) {
    for kind in ChangeKind::ALL {
        let weak = Arc::downgrade(inner);
        let id = inner.bus.on(kind, move |event: ChangeEvent| {
            let weak = Weak::clone(&weak);
            async move {
                if let Some(inner) = weak.upgrade() {
                    let data = serde_json::to_value(&event)?;
                    inner.broadcast(event.kind.as_str(), data);
                }
                Ok::<(), anyhow::Error>(())
            }
        });
        state.upstream.push((kind, id));
    }

    let weak = Arc::downgrade(inner);
    let every = inner.heartbeat_every;
    state.heartbeat = Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(inner) = weak.upgrade() else { break };
            inner.broadcast("heartbeat", serde_json::json!({}));
        }
    }));
    info!("First subscriber connected; upstream subscription established");
}

impl ChangeGateway {
    pub fn new(bus: EventBus, heartbeat_every: Duration) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                bus,
                heartbeat_every,
                state: Mutex::new(GatewayState {
                    subscribers: HashMap::new(),
                    next_subscriber: 0,
                    heartbeat: None,
                    upstream: Vec::new(),
                    ids: ulid::Generator::new(),
                }),
            }),
        }
    }

    /// Attach a subscriber. Its first message is `connected`.
    pub fn connect(&self) -> Subscriber {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let mut state = self.inner.lock();
        let id = state.next_subscriber;
        state.next_subscriber += 1;

        let hello = state.message("connected", serde_json::json!({ "subscriberId": id }));
        // A fresh queue always has room.
        let _ = tx.try_send(hello);
        state.subscribers.insert(id, tx);
        if state.subscribers.len() == 1 {
            start_upstream(&self.inner, &mut state);
        }
        metrics::gauge!("gateway_subscribers").set(state.subscribers.len() as f64);
        debug!(subscriber = id, total = state.subscribers.len(), "Subscriber connected");

        Subscriber {
            id,
            rx,
            gateway: Arc::clone(&self.inner),
        }
    }

    /// Deliver a message to every subscriber. Returns how many still hold it.
    pub fn broadcast(&self, event: &str, data: serde_json::Value) -> usize {
        self.inner.broadcast(event, data)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// True while bus listeners and the heartbeat are held.
    pub fn is_upstream_active(&self) -> bool {
        let state = self.inner.lock();
        !state.upstream.is_empty() || state.heartbeat.is_some()
    }
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next message, or `None` once the gateway dropped this subscriber and
    /// the buffered messages are consumed.
    pub async fn recv(&mut self) -> Option<GatewayMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.gateway.disconnect(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_connect_sends_ack_first() {
        let gateway = ChangeGateway::new(EventBus::new(), DEFAULT_HEARTBEAT);
        let mut sub = gateway.connect();

        let hello = sub.recv().await.unwrap();
        assert_eq!(hello.event, "connected");
        assert_eq!(hello.data["subscriberId"], sub.id());
        assert_eq!(hello.id.len(), 26);
    }

    #[tokio::test]
    async fn test_bus_events_reach_subscribers() {
        let bus = EventBus::new();
        let gateway = ChangeGateway::new(bus.clone(), DEFAULT_HEARTBEAT);
        let mut a = gateway.connect();
        let mut b = gateway.connect();
        a.recv().await.unwrap();
        b.recv().await.unwrap();

        bus.emit(ChangeEvent::new(ChangeKind::SessionChanged, "-work-app", "s1"));

        for sub in [&mut a, &mut b] {
            let message = sub.recv().await.unwrap();
            assert_eq!(message.event, "sessionChanged");
            assert_eq!(message.data["entityId"], "s1");
            assert_eq!(message.data["containerId"], "-work-app");
        }
    }

    #[tokio::test]
    async fn test_message_ids_increase() {
        let gateway = ChangeGateway::new(EventBus::new(), DEFAULT_HEARTBEAT);
        let mut sub = gateway.connect();
        for i in 0..20 {
            gateway.broadcast("tick", serde_json::json!({ "i": i }));
        }

        let mut last = String::new();
        for _ in 0..21 {
            let message = sub.recv().await.unwrap();
            assert!(message.id > last, "{} <= {}", message.id, last);
            last = message.id;
        }
    }

    #[tokio::test]
    async fn test_upstream_released_at_zero_subscribers() {
        let bus = EventBus::new();
        let gateway = ChangeGateway::new(bus.clone(), DEFAULT_HEARTBEAT);
        assert!(!gateway.is_upstream_active());

        let a = gateway.connect();
        let b = gateway.connect();
        assert!(gateway.is_upstream_active());
        assert_eq!(bus.listener_count(ChangeKind::SessionChanged), 1);
        assert_eq!(bus.listener_count(ChangeKind::AgentSessionChanged), 1);

        drop(a);
        assert!(gateway.is_upstream_active());
        drop(b);
        assert_eq!(gateway.subscriber_count(), 0);
        assert!(!gateway.is_upstream_active());
        assert_eq!(bus.listener_count(ChangeKind::SessionChanged), 0);

        let _c = gateway.connect();
        assert!(gateway.is_upstream_active());
        assert_eq!(bus.listener_count(ChangeKind::SessionListChanged), 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_removed_alone() {
        let gateway = ChangeGateway::new(EventBus::new(), DEFAULT_HEARTBEAT);
        let mut slow = gateway.connect();
        let mut fast = gateway.connect();
        fast.recv().await.unwrap();

        for i in 0..SUBSCRIBER_QUEUE_CAPACITY {
            gateway.broadcast("tick", serde_json::json!({ "i": i }));
            fast.recv().await.unwrap();
        }

        assert_eq!(gateway.subscriber_count(), 1);
        assert!(gateway.is_upstream_active());

        // The removed subscriber still drains what was buffered, then ends.
        let mut buffered = 0;
        while slow.recv().await.is_some() {
            buffered += 1;
        }
        assert_eq!(buffered, SUBSCRIBER_QUEUE_CAPACITY);
    }

    #[tokio::test]
    async fn test_closed_receiver_is_removed_on_broadcast() {
        let gateway = ChangeGateway::new(EventBus::new(), DEFAULT_HEARTBEAT);
        let mut sub = gateway.connect();
        sub.rx.close();

        assert_eq!(gateway.broadcast("tick", serde_json::json!({})), 0);
        assert_eq!(gateway.subscriber_count(), 0);
        assert!(!gateway.is_upstream_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_while_connected() {
        let gateway = ChangeGateway::new(EventBus::new(), Duration::from_secs(1));
        let mut sub = gateway.connect();
        assert_eq!(sub.recv().await.unwrap().event, "connected");
        assert_eq!(sub.recv().await.unwrap().event, "heartbeat");
    }
}
