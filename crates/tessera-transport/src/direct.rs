//! Direct peer channels negotiated through relay signaling.
//!
//! Peers announce a direct listen address in `signal` frames sent through
//! the relay. The peer with the lexicographically smaller id dials; the
//! resulting TCP stream is a reliable, ordered channel used for all
//! subsequent frames between the pair, leaving the relay for late-joiner
//! signaling only.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tessera_events::{EventBus, Subscription};

use crate::relay::{deliver, read_json, write_json};
use crate::{
    FrameKind, RelayTransport, Result, Transport, TransportError, WireFrame, NET_FRAME_TOPIC,
    PEER_CONNECTED_TOPIC,
};

type Links = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<WireFrame>>>>;

/// A relay transport upgraded with direct peer channels.
pub struct DirectTransport {
    peer_id: String,
    relay: Arc<RelayTransport>,
    links: Links,
    _subscriptions: Vec<Subscription>,
}

impl DirectTransport {
    /// Starts a direct listener and begins upgrading relay peers.
    ///
    /// `bus` must be the same bus the relay transport delivers to: the
    /// upgrade listens for `net:peer-connected` (to offer its address) and
    /// for incoming `signal` frames (to dial).
    pub async fn upgrade(relay: RelayTransport, bus: EventBus) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;
        let peer_id = relay.peer_id().to_string();
        let relay = Arc::new(relay);
        let links: Links = Arc::new(Mutex::new(HashMap::new()));

        // Accept inbound direct channels; the dialer's first frame is a
        // hello naming it.
        {
            let links = links.clone();
            let bus = bus.clone();
            let local_id = peer_id.clone();
            tokio::spawn(async move {
                while let Ok((stream, remote)) = listener.accept().await {
                    debug!(remote = %remote, "direct channel accepted");
                    tokio::spawn(accept_link(
                        stream,
                        links.clone(),
                        bus.clone(),
                        local_id.clone(),
                    ));
                }
            });
        }

        let mut subscriptions = Vec::new();

        // Offer our direct address to every newly connected peer.
        {
            let relay = relay.clone();
            let local_id = peer_id.clone();
            subscriptions.push(bus.on(PEER_CONNECTED_TOPIC, move |event| {
                let Some(peer) = event.payload["peerId"].as_str() else {
                    return;
                };
                let offer = serde_json::json!({ "addr": local_addr.to_string() }).to_string();
                if let Err(e) = relay.send(peer, WireFrame::signal(&local_id, &offer)) {
                    warn!(peer = %peer, error = %e, "direct offer failed");
                }
            }));
        }

        // Dial peers whose signal we receive; the smaller id dials, the
        // larger id answers with its own offer so the handshake completes
        // regardless of which side saw the other join first.
        {
            let links = links.clone();
            let relay = relay.clone();
            let bus_for_dial = bus.clone();
            let local_id = peer_id.clone();
            subscriptions.push(bus.on(NET_FRAME_TOPIC, move |event| {
                let Ok(frame) =
                    serde_json::from_value::<WireFrame>(event.payload["frame"].clone())
                else {
                    return;
                };
                if frame.kind != FrameKind::Signal {
                    return;
                }
                let Some(remote_id) = frame.from_peer_id.clone() else {
                    return;
                };
                if links.lock().contains_key(&remote_id) {
                    return;
                }
                if local_id.as_str() >= remote_id.as_str() {
                    let offer =
                        serde_json::json!({ "addr": local_addr.to_string() }).to_string();
                    let _ = relay.send(&remote_id, WireFrame::signal(&local_id, &offer));
                    return;
                }
                let Some(addr) = frame
                    .data
                    .as_deref()
                    .and_then(|d| serde_json::from_str::<serde_json::Value>(d).ok())
                    .and_then(|v| v["addr"].as_str().map(str::to_string))
                    .and_then(|a| a.parse::<SocketAddr>().ok())
                else {
                    return;
                };
                tokio::spawn(dial_link(
                    addr,
                    remote_id,
                    links.clone(),
                    bus_for_dial.clone(),
                    local_id.clone(),
                ));
            }));
        }

        info!(peer = %peer_id, addr = %local_addr, "direct transport ready");
        Ok(Self {
            peer_id,
            relay,
            links,
            _subscriptions: subscriptions,
        })
    }

    /// Peers currently reachable over a direct channel.
    pub fn direct_peers(&self) -> Vec<String> {
        self.links.lock().keys().cloned().collect()
    }
}

async fn accept_link(stream: TcpStream, links: Links, bus: EventBus, local_id: String) {
    let (mut reader, mut writer) = stream.into_split();
    let hello: WireFrame = match read_json::<WireFrame>(&mut reader).await {
        Ok(Some(frame)) if frame.kind == FrameKind::Hello => frame,
        _ => return,
    };
    let Some(remote_id) = hello.from_peer_id else {
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<WireFrame>();
    links.lock().insert(remote_id.clone(), tx);
    info!(peer = %remote_id, "direct channel up (inbound)");

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_json(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    read_link(reader, links, bus, local_id, remote_id).await;
}

async fn dial_link(
    addr: SocketAddr,
    remote_id: String,
    links: Links,
    bus: EventBus,
    local_id: String,
) {
    let stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(peer = %remote_id, error = %e, "direct dial failed");
            return;
        }
    };
    let (reader, mut writer) = stream.into_split();
    if write_json(&mut writer, &WireFrame::hello(&local_id))
        .await
        .is_err()
    {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<WireFrame>();
    links.lock().insert(remote_id.clone(), tx);
    info!(peer = %remote_id, "direct channel up (outbound)");

    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_json(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    read_link(reader, links, bus, local_id, remote_id).await;
}

async fn read_link(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    links: Links,
    bus: EventBus,
    local_id: String,
    remote_id: String,
) {
    loop {
        match read_json::<WireFrame>(&mut reader).await {
            Ok(Some(frame)) => deliver(&bus, &local_id, frame),
            Ok(None) => break,
            Err(e) => {
                warn!(peer = %remote_id, error = %e, "direct read failed");
                break;
            }
        }
    }
    links.lock().remove(&remote_id);
    debug!(peer = %remote_id, "direct channel down");
}

impl Transport for DirectTransport {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Prefers the direct channel, falling back to the relay.
    fn send(&self, to: &str, frame: WireFrame) -> Result<()> {
        let link = self.links.lock().get(to).cloned();
        if let Some(link) = link {
            if link.send(frame).is_ok() {
                return Ok(());
            }
            self.links.lock().remove(to);
            return Err(TransportError::PeerGone(to.to_string()));
        }
        self.relay.send(to, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RelayServer;
    use parking_lot::Mutex as PMutex;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn test_upgrade_establishes_direct_channel() {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();

        let bus_a = EventBus::new();
        let relay_a = RelayTransport::connect(server.local_addr(), "peer-a", bus_a.clone())
            .await
            .unwrap();
        let a = DirectTransport::upgrade(relay_a, bus_a).await.unwrap();

        let bus_b = EventBus::new();
        let relay_b = RelayTransport::connect(server.local_addr(), "peer-b", bus_b.clone())
            .await
            .unwrap();
        let b = DirectTransport::upgrade(relay_b, bus_b.clone()).await.unwrap();
        settle().await;

        // peer-a < peer-b, so a dialed b.
        assert_eq!(a.direct_peers(), ["peer-b"]);
        assert_eq!(b.direct_peers(), ["peer-a"]);

        // Frames sent after the upgrade flow over the direct channel.
        let frames = Arc::new(PMutex::new(Vec::new()));
        let sink = frames.clone();
        bus_b
            .on(NET_FRAME_TOPIC, move |e| sink.lock().push(e.payload.clone()))
            .detach();

        a.send("peer-b", WireFrame::sync("peer-a", b"direct-bytes"))
            .unwrap();
        settle().await;

        let frames = frames.lock();
        let sync: Vec<_> = frames
            .iter()
            .filter(|p| p["frame"]["type"] == "sync")
            .collect();
        assert_eq!(sync.len(), 1);
        assert_eq!(sync[0]["from"], "peer-a");
    }

    #[tokio::test]
    async fn test_send_falls_back_to_relay_without_link() {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();

        let bus_a = EventBus::new();
        let relay_a = RelayTransport::connect(server.local_addr(), "peer-a", bus_a.clone())
            .await
            .unwrap();
        let a = DirectTransport::upgrade(relay_a, bus_a).await.unwrap();

        // Plain relay peer on the other side; no direct upgrade.
        let bus_b = EventBus::new();
        let frames = Arc::new(PMutex::new(Vec::new()));
        let sink = frames.clone();
        bus_b
            .on(NET_FRAME_TOPIC, move |e| sink.lock().push(e.payload.clone()))
            .detach();
        let _b = RelayTransport::connect(server.local_addr(), "peer-b", bus_b)
            .await
            .unwrap();
        settle().await;

        a.send("peer-b", WireFrame::sync("peer-a", b"via-relay"))
            .unwrap();
        settle().await;

        let frames = frames.lock();
        let sync: Vec<_> = frames
            .iter()
            .filter(|p| p["frame"]["type"] == "sync")
            .collect();
        assert_eq!(sync.len(), 1);
    }
}
