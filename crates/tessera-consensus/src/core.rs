//! The consensus core.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use tessera_chronicle::{Chronicle, SyncCursor, LOCAL_SOURCE, STATE_CHANGED_TOPIC};
use tessera_events::{EventBus, Subscription};
use tessera_transport::{
    FrameKind, Transport, WireFrame, NET_FRAME_TOPIC, PEER_CONNECTED_TOPIC,
    PEER_DISCONNECTED_TOPIC,
};

use crate::{BADFRAME_TOPIC, PEER_GONE_TOPIC};

/// Observability counters.
#[derive(Debug, Clone, Default)]
pub struct ConsensusMetrics {
    /// Sync frames sent.
    pub frames_sent: u64,
    /// Sync frames applied.
    pub frames_received: u64,
    /// Malformed frames dropped.
    pub bad_frames: u64,
}

#[derive(Default)]
struct Counters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bad_frames: AtomicU64,
}

/// Per-peer sync state over one chronicle and one transport.
///
/// On `state:changed {source}` the core generates the next sync message
/// for every peer except `source` and sends any non-empty message. On an
/// incoming sync frame it feeds the peer's cursor, which makes the
/// chronicle emit `state:changed {source: peer}` for any advance, and then
/// answers with a follow-up. The broadcast rule guarantees the change is
/// never echoed back to its originator, so a change reaches every peer
/// without re-traversing where it came from.
pub struct ConsensusCore {
    chronicle: Arc<Chronicle>,
    transport: Arc<dyn Transport>,
    cursors: Mutex<HashMap<String, Arc<Mutex<SyncCursor>>>>,
    bus: EventBus,
    counters: Counters,
    _subscriptions: Mutex<Vec<Subscription>>,
}

impl ConsensusCore {
    /// Attaches a core to a chronicle and transport.
    ///
    /// `bus` must be the chronicle's bus: the core listens there for
    /// `state:changed`, incoming `net:frame`s, and peer lifecycle events.
    pub fn attach(
        chronicle: Arc<Chronicle>,
        transport: Arc<dyn Transport>,
        bus: EventBus,
    ) -> Arc<Self> {
        let core = Arc::new(Self {
            chronicle,
            transport,
            cursors: Mutex::new(HashMap::new()),
            bus: bus.clone(),
            counters: Counters::default(),
            _subscriptions: Mutex::new(Vec::new()),
        });

        let mut subscriptions = Vec::new();

        {
            let weak = Arc::downgrade(&core);
            subscriptions.push(bus.on(STATE_CHANGED_TOPIC, move |event| {
                if let Some(core) = weak.upgrade() {
                    let source = event.payload["source"].as_str().unwrap_or(LOCAL_SOURCE);
                    core.on_state_changed(source);
                }
            }));
        }
        {
            let weak: Weak<ConsensusCore> = Arc::downgrade(&core);
            subscriptions.push(bus.on(NET_FRAME_TOPIC, move |event| {
                if let Some(core) = weak.upgrade() {
                    let Some(from) = event.payload["from"].as_str() else {
                        return;
                    };
                    match serde_json::from_value::<WireFrame>(event.payload["frame"].clone()) {
                        Ok(frame) => core.handle_frame(from, frame),
                        Err(e) => core.bad_frame(from, &e.to_string()),
                    }
                }
            }));
        }
        {
            let weak: Weak<ConsensusCore> = Arc::downgrade(&core);
            subscriptions.push(bus.on(PEER_CONNECTED_TOPIC, move |event| {
                if let Some(core) = weak.upgrade() {
                    if let Some(peer) = event.payload["peerId"].as_str() {
                        core.add_peer(peer);
                    }
                }
            }));
        }
        {
            let weak: Weak<ConsensusCore> = Arc::downgrade(&core);
            subscriptions.push(bus.on(PEER_DISCONNECTED_TOPIC, move |event| {
                if let Some(core) = weak.upgrade() {
                    if let Some(peer) = event.payload["peerId"].as_str() {
                        core.remove_peer(peer);
                    }
                }
            }));
        }

        *core._subscriptions.lock() = subscriptions;
        core
    }

    /// The local peer id.
    pub fn peer_id(&self) -> &str {
        self.transport.peer_id()
    }

    /// Peers with an active sync cursor.
    pub fn peers(&self) -> Vec<String> {
        self.cursors.lock().keys().cloned().collect()
    }

    /// Initializes a cursor for a peer and opens sync toward it.
    pub fn add_peer(&self, peer: &str) {
        if peer == self.peer_id() {
            return;
        }
        self.cursors
            .lock()
            .entry(peer.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SyncCursor::new())));
        debug!(peer = %peer, "peer cursor initialized");
        self.sync_peer(peer);
    }

    /// Drops a peer's cursor; state converges again on reconnect because
    /// the cursor restarts fresh.
    pub fn remove_peer(&self, peer: &str) {
        if self.cursors.lock().remove(peer).is_some() {
            debug!(peer = %peer, "peer cursor dropped");
            self.bus
                .emit(PEER_GONE_TOPIC, serde_json::json!({ "peerId": peer }));
        }
    }

    /// Current metrics snapshot.
    pub fn metrics(&self) -> ConsensusMetrics {
        ConsensusMetrics {
            frames_sent: self.counters.frames_sent.load(Ordering::SeqCst),
            frames_received: self.counters.frames_received.load(Ordering::SeqCst),
            bad_frames: self.counters.bad_frames.load(Ordering::SeqCst),
        }
    }

    /// Source-tagged broadcast: local changes go to all peers, remote
    /// changes to all peers except their originator.
    fn on_state_changed(&self, source: &str) {
        let peers: Vec<String> = self.cursors.lock().keys().cloned().collect();
        for peer in peers {
            if source != LOCAL_SOURCE && peer == source {
                continue;
            }
            self.sync_peer(&peer);
        }
    }

    /// Generates and sends the next sync message for one peer, if any.
    fn sync_peer(&self, peer: &str) {
        let Some(cursor) = self.cursors.lock().get(peer).cloned() else {
            return;
        };
        let message = {
            let mut cursor = cursor.lock();
            self.chronicle.generate_sync(&mut cursor)
        };
        let Some(bytes) = message else {
            return;
        };

        let frame = WireFrame::sync(self.peer_id(), &bytes);
        match self.transport.send(peer, frame) {
            Ok(()) => {
                self.counters.frames_sent.fetch_add(1, Ordering::SeqCst);
                debug!(peer = %peer, bytes = bytes.len(), "sync frame sent");
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "sync send failed");
                self.remove_peer(peer);
            }
        }
    }

    fn handle_frame(&self, from: &str, frame: WireFrame) {
        match frame.kind {
            FrameKind::Sync => self.handle_sync(from, &frame),
            FrameKind::Hello => self.add_peer(from),
            FrameKind::Bye => self.remove_peer(from),
            // Signaling is a transport concern.
            FrameKind::Signal => {}
        }
    }

    fn handle_sync(&self, from: &str, frame: &WireFrame) {
        let bytes = match frame.sync_data() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.bad_frame(from, &e.to_string());
                return;
            }
        };

        let cursor = self
            .cursors
            .lock()
            .entry(from.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SyncCursor::new())))
            .clone();

        // Applying may advance the document, which emits
        // `state:changed {source: from}` and re-broadcasts to everyone
        // except `from` while this cursor is held; the source rule keeps
        // the originator's cursor out of that fan-out.
        let followup = {
            let mut cursor = cursor.lock();
            match self
                .chronicle
                .apply_sync(&mut cursor, &bytes, from)
            {
                Ok(_) => {
                    self.counters.frames_received.fetch_add(1, Ordering::SeqCst);
                    self.chronicle.generate_sync(&mut cursor)
                }
                Err(e) => {
                    self.bad_frame(from, &e.to_string());
                    return;
                }
            }
        };

        if let Some(bytes) = followup {
            let frame = WireFrame::sync(self.peer_id(), &bytes);
            if self.transport.send(from, frame).is_ok() {
                self.counters.frames_sent.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn bad_frame(&self, from: &str, error: &str) {
        warn!(from = %from, error = %error, "dropping malformed frame");
        self.counters.bad_frames.fetch_add(1, Ordering::SeqCst);
        self.bus.emit(
            BADFRAME_TOPIC,
            serde_json::json!({ "from": from, "error": error }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_chronicle::DocDraft;
    use tessera_transport::MemoryHub;
    use tessera_types::StackState;

    struct Peer {
        chronicle: Arc<Chronicle>,
        core: Arc<ConsensusCore>,
        bus: EventBus,
    }

    fn make_peer(hub: &MemoryHub, id: &str) -> Peer {
        let bus = EventBus::new();
        let chronicle = Arc::new(Chronicle::new(id, bus.clone()));
        let transport = Arc::new(hub.connect(id, bus.clone()));
        let core = ConsensusCore::attach(chronicle.clone(), transport, bus.clone());
        Peer {
            chronicle,
            core,
            bus,
        }
    }

    fn seed_stack(draft: &mut DocDraft) -> tessera_chronicle::Result<()> {
        draft.put_record("stack", &StackState::default())
    }

    #[test]
    fn test_peers_learn_of_each_other() {
        let hub = MemoryHub::new();
        let a = make_peer(&hub, "peer-a");
        let b = make_peer(&hub, "peer-b");
        hub.pump();

        assert_eq!(a.core.peers(), ["peer-b"]);
        assert_eq!(b.core.peers(), ["peer-a"]);
    }

    #[test]
    fn test_local_change_reaches_peer() {
        let hub = MemoryHub::new();
        let a = make_peer(&hub, "peer-a");
        let b = make_peer(&hub, "peer-b");
        hub.pump();

        a.chronicle.change("seed", seed_stack).unwrap();
        hub.pump();

        assert_eq!(a.chronicle.state(), b.chronicle.state());
        assert!(b.chronicle.state().get("stack").is_some());
    }

    #[test]
    fn test_remote_application_carries_peer_source() {
        let hub = MemoryHub::new();
        let a = make_peer(&hub, "peer-a");
        let b = make_peer(&hub, "peer-b");
        hub.pump();

        let sources = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = sources.clone();
        b.bus
            .on(STATE_CHANGED_TOPIC, move |e| {
                sink.lock()
                    .push(e.payload["source"].as_str().unwrap_or("").to_string())
            })
            .detach();

        a.chronicle.change("seed", seed_stack).unwrap();
        hub.pump();

        let sources = sources.lock();
        assert!(!sources.is_empty());
        assert!(sources.iter().all(|s| s == "peer-a"), "{sources:?}");
    }

    #[test]
    fn test_disconnect_drops_cursor_and_reconnect_converges() {
        let hub = MemoryHub::new();
        let a = make_peer(&hub, "peer-a");
        let b = make_peer(&hub, "peer-b");
        hub.pump();

        hub.disconnect("peer-b");
        hub.pump();
        assert!(a.core.peers().is_empty());

        a.chronicle.change("while-away", seed_stack).unwrap();
        hub.pump();

        // Reconnect with a fresh cursor; the change still converges.
        let Peer {
            chronicle: b_chronicle,
            core: b_core,
            bus: b_bus,
        } = b;
        drop(b_core);
        let transport = Arc::new(hub.connect("peer-b", b_bus.clone()));
        let _core2 = ConsensusCore::attach(b_chronicle.clone(), transport, b_bus);
        hub.pump();

        assert_eq!(a.chronicle.state(), b_chronicle.state());
    }

    #[test]
    fn test_malformed_frame_dropped_with_event() {
        let hub = MemoryHub::new();
        let a = make_peer(&hub, "peer-a");
        let bad_frames = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = bad_frames.clone();
        a.bus
            .on(BADFRAME_TOPIC, move |e| sink.lock().push(e.payload.clone()))
            .detach();

        // A bare transport with no consensus core: valid base64 payload
        // that is not a real sync message.
        let rogue = hub.connect("peer-x", EventBus::new());
        hub.pump();
        rogue
            .send("peer-a", WireFrame::sync("peer-x", b"not a real sync message"))
            .unwrap();
        hub.pump();

        assert_eq!(bad_frames.lock().len(), 1);
        assert_eq!(a.core.metrics().bad_frames, 1);
        assert_eq!(a.chronicle.state(), serde_json::json!({}));
    }

    #[test]
    fn test_same_frame_twice_is_idempotent() {
        let hub = MemoryHub::new();
        let a = make_peer(&hub, "peer-a");
        let b = make_peer(&hub, "peer-b");
        hub.pump();

        a.chronicle.change("seed", seed_stack).unwrap();
        hub.pump();
        let state_after = b.chronicle.state();
        let received_after = b.core.metrics().frames_received;

        // Re-deliver: generate a fresh duplicate from a's perspective by
        // changing nothing; the mesh is quiescent, no frames flow.
        hub.pump();
        assert_eq!(b.chronicle.state(), state_after);
        assert_eq!(b.core.metrics().frames_received, received_after);
    }
}
