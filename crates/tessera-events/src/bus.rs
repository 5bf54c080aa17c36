//! Event bus implementation.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::warn;

use tessera_types::now_millis;

/// Topic that receives every event as-is.
pub const WILDCARD: &str = "*";

/// Topic that receives handler failures.
pub const ERROR_TOPIC: &str = "error";

/// An event delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Topic the event was emitted on.
    pub topic: String,
    /// JSON payload.
    pub payload: serde_json::Value,
    /// Milliseconds since epoch at emit time.
    pub ts: i64,
}

type Handler = Arc<dyn Fn(&Event) + Send + Sync + 'static>;

struct Entry {
    id: u64,
    topic: String,
    once: bool,
    handler: Handler,
}

#[derive(Default)]
struct Inner {
    entries: Mutex<Vec<Entry>>,
    stats: Mutex<BusStats>,
}

/// Bus statistics.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    /// Total events emitted.
    pub events_emitted: u64,
    /// Total handler invocations.
    pub deliveries: u64,
    /// Handlers that panicked during fan-out.
    pub handler_errors: u64,
}

/// Publish/subscribe over string topics.
///
/// Cloning the bus shares the underlying subscriber table. Fan-out is
/// synchronous and runs over a snapshot taken at emit time, so subscriptions
/// made during fan-out do not receive the current event and reentrant `emit`
/// from inside a handler is allowed.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Inner>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    /// Creates a new bus with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a topic; returns an unsubscribe handle.
    ///
    /// Dropping the returned [`Subscription`] removes the handler; call
    /// [`Subscription::detach`] to keep it registered for the bus lifetime.
    pub fn on<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(topic, false, Arc::new(handler))
    }

    /// Registers a handler that fires at most once.
    pub fn once<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(topic, true, Arc::new(handler))
    }

    fn register(&self, topic: &str, once: bool, handler: Handler) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.entries.lock().push(Entry {
            id,
            topic: topic.to_string(),
            once,
            handler,
        });
        Subscription {
            inner: Arc::downgrade(&self.inner),
            id,
            detached: false,
        }
    }

    /// Emits an event; handlers run to completion in registration order
    /// before this returns.
    pub fn emit(&self, topic: &str, payload: serde_json::Value) {
        let event = Event {
            topic: topic.to_string(),
            payload,
            ts: now_millis(),
        };
        self.dispatch(&event);
    }

    fn dispatch(&self, event: &Event) {
        // Snapshot matching handlers and retire one-shot entries inside the
        // same lock, so a reentrant emit cannot fire them twice.
        let matched: Vec<Handler> = {
            let mut entries = self.inner.entries.lock();
            let matched: Vec<(u64, Handler)> = entries
                .iter()
                .filter(|e| e.topic == event.topic || e.topic == WILDCARD)
                .map(|e| (e.id, e.handler.clone()))
                .collect();
            let fired: Vec<u64> = entries
                .iter()
                .filter(|e| e.once && (e.topic == event.topic || e.topic == WILDCARD))
                .map(|e| e.id)
                .collect();
            entries.retain(|e| !fired.contains(&e.id));
            matched.into_iter().map(|(_, h)| h).collect()
        };

        {
            let mut stats = self.inner.stats.lock();
            stats.events_emitted += 1;
            stats.deliveries += matched.len() as u64;
        }

        for handler in matched {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
            if let Err(panic) = outcome {
                self.inner.stats.lock().handler_errors += 1;
                let message = panic_message(&panic);
                warn!(topic = %event.topic, error = %message, "event handler panicked");
                if event.topic != ERROR_TOPIC {
                    self.emit(
                        ERROR_TOPIC,
                        serde_json::json!({
                            "topic": event.topic,
                            "error": message,
                        }),
                    );
                }
            }
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Current statistics snapshot.
    pub fn stats(&self) -> BusStats {
        self.inner.stats.lock().clone()
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Handle to a registered subscriber; dropping it unsubscribes.
pub struct Subscription {
    inner: Weak<Inner>,
    id: u64,
    detached: bool,
}

impl Subscription {
    /// Keeps the handler registered for the lifetime of the bus.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            inner.entries.lock().retain(|e| e.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;

    fn collector() -> (Arc<PMutex<Vec<String>>>, impl Fn(&Event) + Send + Sync) {
        let seen = Arc::new(PMutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |e: &Event| sink.lock().push(e.topic.clone()))
    }

    #[test]
    fn test_emit_reaches_subscriber() {
        let bus = EventBus::new();
        let (seen, handler) = collector();
        let _sub = bus.on("stack:draw", handler);

        bus.emit("stack:draw", serde_json::json!({"count": 1}));
        bus.emit("stack:burn", serde_json::json!({}));

        assert_eq!(seen.lock().as_slice(), ["stack:draw"]);
    }

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(PMutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let _a = bus.on("t", move |_| o1.lock().push(1));
        let _b = bus.on("t", move |_| o2.lock().push(2));

        bus.emit("t", serde_json::Value::Null);
        assert_eq!(order.lock().as_slice(), [1, 2]);
    }

    #[test]
    fn test_once_fires_at_most_once() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        let _sub = bus.once("t", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit("t", serde_json::Value::Null);
        bus.emit("t", serde_json::Value::Null);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_wildcard_receives_everything() {
        let bus = EventBus::new();
        let (seen, handler) = collector();
        let _sub = bus.on(WILDCARD, handler);

        bus.emit("a", serde_json::Value::Null);
        bus.emit("b", serde_json::Value::Null);
        assert_eq!(seen.lock().as_slice(), ["a", "b"]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::new();
        let (seen, handler) = collector();
        let sub = bus.on("t", handler);
        bus.emit("t", serde_json::Value::Null);

        drop(sub);
        bus.emit("t", serde_json::Value::Null);
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_detach_keeps_subscription() {
        let bus = EventBus::new();
        let (seen, handler) = collector();
        bus.on("t", handler).detach();

        bus.emit("t", serde_json::Value::Null);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_fanout() {
        let bus = EventBus::new();
        let (seen, handler) = collector();
        let _bad = bus.on("t", |_| panic!("boom"));
        let _good = bus.on("t", handler);

        let errors = Arc::new(PMutex::new(Vec::new()));
        let sink = errors.clone();
        let _err = bus.on(ERROR_TOPIC, move |e| sink.lock().push(e.payload.clone()));

        bus.emit("t", serde_json::Value::Null);

        assert_eq!(seen.lock().len(), 1, "later handler still ran");
        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["error"], "boom");
        assert_eq!(bus.stats().handler_errors, 1);
    }

    #[test]
    fn test_subscription_during_fanout_misses_current_event() {
        let bus = EventBus::new();
        let inner_count = Arc::new(AtomicU64::new(0));

        let bus2 = bus.clone();
        let ic = inner_count.clone();
        let _outer = bus.on("t", move |_| {
            let ic = ic.clone();
            bus2.on("t", move |_| {
                ic.fetch_add(1, Ordering::SeqCst);
            })
            .detach();
        });

        bus.emit("t", serde_json::Value::Null);
        assert_eq!(
            inner_count.load(Ordering::SeqCst),
            0,
            "new subscription must not see the in-flight event"
        );

        bus.emit("t", serde_json::Value::Null);
        assert!(inner_count.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_reentrant_emit() {
        let bus = EventBus::new();
        let (seen, handler) = collector();
        let _inner = bus.on("inner", handler);

        let bus2 = bus.clone();
        let _outer = bus.on("outer", move |_| {
            bus2.emit("inner", serde_json::Value::Null);
        });

        bus.emit("outer", serde_json::Value::Null);
        assert_eq!(seen.lock().as_slice(), ["inner"]);
    }

    #[test]
    fn test_stats() {
        let bus = EventBus::new();
        let _sub = bus.on("t", |_| {});
        bus.emit("t", serde_json::Value::Null);
        bus.emit("u", serde_json::Value::Null);

        let stats = bus.stats();
        assert_eq!(stats.events_emitted, 2);
        assert_eq!(stats.deliveries, 1);
        assert_eq!(stats.handler_errors, 0);
    }
}
