//! In-memory mesh transport for tests and local simulation.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use tessera_events::EventBus;

use crate::{
    Result, Transport, TransportError, WireFrame, NET_FRAME_TOPIC, PEER_CONNECTED_TOPIC,
    PEER_DISCONNECTED_TOPIC,
};

struct QueuedFrame {
    to: String,
    from: String,
    frame: WireFrame,
}

#[derive(Default)]
struct HubInner {
    peers: RwLock<HashMap<String, EventBus>>,
    queue: Mutex<VecDeque<QueuedFrame>>,
    pumping: Mutex<()>,
    frames_delivered: AtomicU64,
}

/// A hub connecting any number of in-process peers.
///
/// Sends are queued and delivered by [`MemoryHub::pump`], so handler
/// reentrancy is bounded and tests can count every frame that crossed the
/// mesh.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

impl MemoryHub {
    /// Creates an empty hub.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connects a peer, announcing it to everyone already connected (and
    /// everyone already connected to it).
    pub fn connect(&self, peer_id: &str, bus: EventBus) -> MemoryTransport {
        let existing: Vec<(String, EventBus)> = {
            let mut peers = self.inner.peers.write();
            let existing = peers
                .iter()
                .map(|(id, bus)| (id.clone(), bus.clone()))
                .collect();
            peers.insert(peer_id.to_string(), bus.clone());
            existing
        };

        for (other_id, other_bus) in existing {
            other_bus.emit(
                PEER_CONNECTED_TOPIC,
                serde_json::json!({ "peerId": peer_id }),
            );
            bus.emit(
                PEER_CONNECTED_TOPIC,
                serde_json::json!({ "peerId": other_id }),
            );
        }

        MemoryTransport {
            inner: self.inner.clone(),
            peer_id: peer_id.to_string(),
        }
    }

    /// Disconnects a peer; its queued frames are dropped and everyone else
    /// is notified.
    pub fn disconnect(&self, peer_id: &str) {
        self.inner.peers.write().remove(peer_id);
        self.inner
            .queue
            .lock()
            .retain(|q| q.to != peer_id && q.from != peer_id);
        for bus in self.inner.peers.read().values() {
            bus.emit(
                PEER_DISCONNECTED_TOPIC,
                serde_json::json!({ "peerId": peer_id }),
            );
        }
    }

    /// Delivers queued frames until the mesh is quiescent.
    ///
    /// Handlers may enqueue further frames; delivery continues until the
    /// queue drains. Returns the number of frames delivered by this call.
    pub fn pump(&self) -> u64 {
        let _guard = self.inner.pumping.lock();
        let mut delivered = 0;
        loop {
            let next = self.inner.queue.lock().pop_front();
            let Some(queued) = next else {
                break;
            };
            let target = self.inner.peers.read().get(&queued.to).cloned();
            if let Some(bus) = target {
                delivered += 1;
                self.inner.frames_delivered.fetch_add(1, Ordering::SeqCst);
                debug!(from = %queued.from, to = %queued.to, "mesh frame delivered");
                bus.emit(
                    NET_FRAME_TOPIC,
                    serde_json::json!({
                        "from": queued.from,
                        "frame": queued.frame,
                    }),
                );
            }
        }
        delivered
    }

    /// Total frames delivered across the hub's lifetime.
    pub fn frames_delivered(&self) -> u64 {
        self.inner.frames_delivered.load(Ordering::SeqCst)
    }

    /// Connected peer ids.
    pub fn peers(&self) -> Vec<String> {
        self.inner.peers.read().keys().cloned().collect()
    }
}

/// One peer's handle onto a [`MemoryHub`].
pub struct MemoryTransport {
    inner: Arc<HubInner>,
    peer_id: String,
}

impl Transport for MemoryTransport {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn send(&self, to: &str, frame: WireFrame) -> Result<()> {
        if !self.inner.peers.read().contains_key(to) {
            return Err(TransportError::PeerGone(to.to_string()));
        }
        self.inner.queue.lock().push_back(QueuedFrame {
            to: to.to_string(),
            from: self.peer_id.clone(),
            frame,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;

    #[test]
    fn test_connect_announces_both_ways() {
        let hub = MemoryHub::new();
        let bus_a = EventBus::new();
        let seen_a = Arc::new(PMutex::new(Vec::new()));
        let sink = seen_a.clone();
        bus_a
            .on(PEER_CONNECTED_TOPIC, move |e| {
                sink.lock().push(e.payload["peerId"].as_str().unwrap().to_string())
            })
            .detach();

        hub.connect("a", bus_a);
        let bus_b = EventBus::new();
        let seen_b = Arc::new(PMutex::new(Vec::new()));
        let sink = seen_b.clone();
        bus_b
            .on(PEER_CONNECTED_TOPIC, move |e| {
                sink.lock().push(e.payload["peerId"].as_str().unwrap().to_string())
            })
            .detach();
        hub.connect("b", bus_b);

        assert_eq!(seen_a.lock().as_slice(), ["b"]);
        assert_eq!(seen_b.lock().as_slice(), ["a"]);
    }

    #[test]
    fn test_send_and_pump_delivers() {
        let hub = MemoryHub::new();
        let a = hub.connect("a", EventBus::new());
        let bus_b = EventBus::new();
        let seen = Arc::new(PMutex::new(Vec::new()));
        let sink = seen.clone();
        bus_b
            .on(NET_FRAME_TOPIC, move |e| sink.lock().push(e.payload.clone()))
            .detach();
        hub.connect("b", bus_b);

        a.send("b", WireFrame::hello("a")).unwrap();
        assert!(seen.lock().is_empty(), "not delivered before pump");

        let delivered = hub.pump();
        assert_eq!(delivered, 1);
        assert_eq!(seen.lock()[0]["from"], "a");
        assert_eq!(hub.frames_delivered(), 1);
    }

    #[test]
    fn test_send_to_unknown_peer_fails() {
        let hub = MemoryHub::new();
        let a = hub.connect("a", EventBus::new());
        let err = a.send("ghost", WireFrame::hello("a")).unwrap_err();
        assert!(matches!(err, TransportError::PeerGone(_)));
    }

    #[test]
    fn test_disconnect_notifies_and_drops_queue() {
        let hub = MemoryHub::new();
        let a = hub.connect("a", EventBus::new());
        let bus_b = EventBus::new();
        hub.connect("b", bus_b);

        a.send("b", WireFrame::hello("a")).unwrap();
        hub.disconnect("b");
        assert_eq!(hub.pump(), 0, "queued frames for a gone peer are dropped");
    }

    #[test]
    fn test_pump_drains_reentrant_sends() {
        let hub = MemoryHub::new();
        let a = hub.connect("a", EventBus::new());

        let bus_b = EventBus::new();
        let b = hub.connect("b", bus_b.clone());
        let replied = Arc::new(PMutex::new(false));
        let flag = replied.clone();
        let b_transport = Arc::new(b);
        let b_for_handler = b_transport.clone();
        bus_b
            .on(NET_FRAME_TOPIC, move |_| {
                if !*flag.lock() {
                    *flag.lock() = true;
                    let _ = b_for_handler.send("a", WireFrame::hello("b"));
                }
            })
            .detach();

        a.send("b", WireFrame::hello("a")).unwrap();
        let delivered = hub.pump();
        assert_eq!(delivered, 2, "the reply enqueued mid-pump was delivered");
    }
}
