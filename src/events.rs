//! In-process event bus with bounded fan-out.
//!
//! Publishing never blocks: every subscriber owns a bounded queue and a
//! full queue simply drops the event for that subscriber. Callback
//! subscribers get their own consumer task with a per-event timeout so one
//! slow handler cannot stall the rest. Events carrying an `id` are deduped
//! against an LRU of recently seen ids, which lets producers re-publish
//! idempotently. The bus is the one process-wide mutable beyond the logger;
//! it is initialized at startup and closed at teardown.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default bound of each subscriber queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default size of the id-dedup LRU.
pub const DEFAULT_DEDUP_CAPACITY: usize = 1024;

/// Default per-event handler timeout for callback subscribers.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle and wire events the gateway publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// An instance was created.
    ServiceCreated,
    /// An instance was stopped and removed.
    ServiceStopped,
    /// An instance flipped between running and degraded.
    ServiceHealthChanged,
    /// A health probe failed.
    ProbeFailed,
    /// A backend wrote a line to stderr.
    Stderr,
    /// An envelope was sent to a backend.
    Sent,
    /// An envelope or notification arrived from a backend.
    Message,
    /// An error the surface wants subscribers to see.
    Error,
    /// Terminal notice: the gateway is shutting down.
    Close,
}

impl EventKind {
    /// The camelCase wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ServiceCreated => "serviceCreated",
            Self::ServiceStopped => "serviceStopped",
            Self::ServiceHealthChanged => "serviceHealthChanged",
            Self::ProbeFailed => "probeFailed",
            Self::Stderr => "stderr",
            Self::Sent => "sent",
            Self::Message => "message",
            Self::Error => "error",
            Self::Close => "close",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One published event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Event class.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Optional identity for dedup across re-publish.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
    /// Event-specific payload.
    pub payload: Value,
}

impl Event {
    /// Creates an event stamped now, without an id.
    #[must_use]
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind,
            id: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Creates an event stamped now with a dedup id.
    #[must_use]
    pub fn with_id(kind: EventKind, id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            id: Some(id.into()),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Async callback invoked per event by a handler subscriber.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Fixed-capacity set remembering recently seen event ids.
struct LruDedup {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl LruDedup {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `true` when the id was already present.
    fn check_and_insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return true;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        false
    }
}

struct SubscriberEntry {
    tx: mpsc::Sender<Event>,
    kinds: Option<HashSet<EventKind>>,
    dropped: AtomicU64,
}

struct BusInner {
    subscribers: DashMap<u64, SubscriberEntry>,
    next_id: AtomicU64,
    dedup: Mutex<LruDedup>,
    closed: AtomicBool,
    handler_timeout: Duration,
}

/// Cloneable handle to the process-wide event bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// A queue-backed subscription; dropping it (or its receiver) detaches the
/// subscriber on the next publish.
pub struct Subscription {
    /// Subscriber id, useful in logs.
    pub id: u64,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Receives the next event, or `None` once the bus has closed.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Consumes the subscription into its raw receiver (for stream wrappers).
    #[must_use]
    pub fn into_receiver(self) -> mpsc::Receiver<Event> {
        self.rx
    }
}

impl EventBus {
    /// Creates a bus with default capacities.
    #[must_use]
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_DEDUP_CAPACITY, DEFAULT_HANDLER_TIMEOUT)
    }

    /// Creates a bus with explicit dedup capacity and handler timeout.
    #[must_use]
    pub fn with_settings(dedup_capacity: usize, handler_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                dedup: Mutex::new(LruDedup::new(dedup_capacity)),
                closed: AtomicBool::new(false),
                handler_timeout,
            }),
        }
    }

    /// Publishes an event to every matching subscriber.
    ///
    /// Duplicate ids within the LRU window are silently dropped. A full
    /// subscriber queue drops the event for that subscriber only; the
    /// publisher never blocks.
    pub fn publish(&self, event: Event) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Some(id) = &event.id {
            let mut dedup = self.inner.dedup.lock().expect("dedup lock poisoned");
            if dedup.check_and_insert(id) {
                debug!(id, kind = %event.kind, "duplicate event suppressed");
                return;
            }
        }

        let mut dead: Vec<u64> = Vec::new();
        for entry in &self.inner.subscribers {
            let sub = entry.value();
            if let Some(kinds) = &sub.kinds {
                if !kinds.contains(&event.kind) {
                    continue;
                }
            }
            match sub.tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped.is_power_of_two() {
                        warn!(subscriber = *entry.key(), dropped, "subscriber queue full, dropping");
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*entry.key()),
            }
        }
        for id in dead {
            self.inner.subscribers.remove(&id);
        }
    }

    /// Subscribes with a bounded queue; `kinds = None` receives everything.
    #[must_use]
    pub fn subscribe(&self, kinds: Option<&[EventKind]>, capacity: usize) -> Subscription {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.insert(
            id,
            SubscriberEntry {
                tx,
                kinds: kinds.map(|k| k.iter().copied().collect()),
                dropped: AtomicU64::new(0),
            },
        );
        Subscription { id, rx }
    }

    /// Subscribes a callback; events are delivered one at a time on a
    /// dedicated consumer task, each invocation bounded by the handler
    /// timeout so a stuck handler cannot block later events permanently.
    pub fn subscribe_handler(&self, kinds: Option<&[EventKind]>, handler: EventHandler) {
        let mut subscription = self.subscribe(kinds, DEFAULT_QUEUE_CAPACITY);
        let timeout = self.inner.handler_timeout;
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let kind = event.kind;
                if tokio::time::timeout(timeout, handler(event)).await.is_err() {
                    warn!(%kind, "event handler timed out, continuing");
                }
            }
        });
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Closes the bus: drains subscriber queues by dropping their senders
    /// and refuses further publishes.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.subscribers.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(None, 16);
        for n in 0..5 {
            bus.publish(Event::new(EventKind::Message, json!({ "n": n })));
        }
        for n in 0..5 {
            let event = sub.recv().await.unwrap();
            assert_eq!(event.payload["n"], n);
        }
    }

    #[tokio::test]
    async fn duplicate_ids_delivered_once() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(None, 16);
        bus.publish(Event::with_id(EventKind::Message, "e1", json!({})));
        bus.publish(Event::with_id(EventKind::Message, "e1", json!({})));
        bus.publish(Event::with_id(EventKind::Message, "e2", json!({})));

        assert_eq!(sub.recv().await.unwrap().id.as_deref(), Some("e1"));
        assert_eq!(sub.recv().await.unwrap().id.as_deref(), Some("e2"));
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn lru_evicts_old_ids() {
        let bus = EventBus::with_settings(2, DEFAULT_HANDLER_TIMEOUT);
        let mut sub = bus.subscribe(None, 16);
        bus.publish(Event::with_id(EventKind::Message, "a", json!({})));
        bus.publish(Event::with_id(EventKind::Message, "b", json!({})));
        bus.publish(Event::with_id(EventKind::Message, "c", json!({}))); // evicts "a"
        bus.publish(Event::with_id(EventKind::Message, "a", json!({}))); // delivered again

        let ids: Vec<_> = [
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
            sub.recv().await.unwrap(),
        ]
        .into_iter()
        .map(|e| e.id.unwrap())
        .collect();
        assert_eq!(ids, ["a", "b", "c", "a"]);
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(None, 2);
        for n in 0..10 {
            bus.publish(Event::new(EventKind::Message, json!({ "n": n })));
        }
        // Only the first two fit; publishing never blocked.
        assert_eq!(sub.recv().await.unwrap().payload["n"], 0);
        assert_eq!(sub.recv().await.unwrap().payload["n"], 1);
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn kind_filter_applies() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(Some(&[EventKind::Stderr]), 16);
        bus.publish(Event::new(EventKind::Message, json!({})));
        bus.publish(Event::new(EventKind::Stderr, json!({"line": "boom"})));
        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Stderr);
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_handler_does_not_block_later_events() {
        let bus = EventBus::with_settings(DEFAULT_DEDUP_CAPACITY, Duration::from_millis(50));
        let (tx, mut rx) = mpsc::channel::<EventKind>(16);

        let handler: EventHandler = Arc::new(move |event: Event| {
            let tx = tx.clone();
            Box::pin(async move {
                if event.kind == EventKind::Stderr {
                    // Far beyond the handler timeout.
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                let _ = tx.send(event.kind).await;
            })
        });
        bus.subscribe_handler(None, handler);

        bus.publish(Event::new(EventKind::Stderr, json!({})));
        bus.publish(Event::new(EventKind::Message, json!({})));

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, EventKind::Message);
    }

    #[tokio::test]
    async fn close_detaches_subscribers() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(None, 4);
        bus.close();
        assert!(sub.recv().await.is_none());
        bus.publish(Event::new(EventKind::Message, json!({})));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = Event::with_id(EventKind::ServiceCreated, "e9", json!({"serviceId": "x"}));
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "serviceCreated");
        assert_eq!(value["id"], "e9");
        assert!(value.get("timestamp").is_some());
    }
}
