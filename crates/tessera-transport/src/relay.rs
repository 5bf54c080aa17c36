//! Central relay transport over TCP.
//!
//! All peers connect to one relay that forwards frames between them.
//! Frames are length-prefixed JSON; the transport guarantees framing.

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tessera_events::EventBus;

use crate::{
    FrameKind, Result, Transport, TransportError, WireFrame, NET_FRAME_TOPIC,
    PEER_CONNECTED_TOPIC, PEER_DISCONNECTED_TOPIC,
};

/// Upper bound on a single frame; larger frames are a codec error.
const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Client-to-relay envelope: `to = None` broadcasts to every other peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RelayEnvelope {
    to: Option<String>,
    frame: WireFrame,
}

pub(crate) async fn write_json<T: Serialize>(
    writer: &mut OwnedWriteHalf,
    value: &T,
) -> Result<()> {
    let body = serde_json::to_vec(value).map_err(|e| TransportError::Codec(e.to_string()))?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(TransportError::Codec(format!(
            "frame too large: {} bytes",
            body.len()
        )));
    }
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    writer.write_all(&buf).await?;
    Ok(())
}

/// Reads one frame; `None` on clean end of stream.
pub(crate) async fn read_json<T: DeserializeOwned>(
    reader: &mut OwnedReadHalf,
) -> Result<Option<T>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::Codec(format!("frame too large: {len} bytes")));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let value = serde_json::from_slice(&body).map_err(|e| TransportError::Codec(e.to_string()))?;
    Ok(Some(value))
}

#[derive(Default)]
struct RelayState {
    peers: parking_lot::Mutex<HashMap<String, mpsc::UnboundedSender<WireFrame>>>,
}

impl RelayState {
    fn route(&self, envelope: RelayEnvelope, from: &str) {
        let peers = self.peers.lock();
        match envelope.to {
            Some(ref to) => {
                if let Some(tx) = peers.get(to) {
                    let _ = tx.send(envelope.frame);
                }
            }
            None => {
                for (id, tx) in peers.iter() {
                    if id != from {
                        let _ = tx.send(envelope.frame.clone());
                    }
                }
            }
        }
    }
}

/// The relay server.
pub struct RelayServer {
    addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl RelayServer {
    /// Binds and starts accepting peers.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(RelayState::default());

        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        debug!(remote = %remote, "relay connection accepted");
                        tokio::spawn(serve_peer(state.clone(), stream));
                    }
                    Err(e) => {
                        warn!(error = %e, "relay accept failed");
                        break;
                    }
                }
            }
        });

        info!(addr = %addr, "relay listening");
        Ok(Self { addr, accept_task })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for RelayServer {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_peer(state: Arc<RelayState>, stream: TcpStream) {
    let (mut reader, mut writer) = stream.into_split();

    // The first envelope must be a hello naming the peer.
    let hello: RelayEnvelope = match read_json::<RelayEnvelope>(&mut reader).await {
        Ok(Some(envelope)) if envelope.frame.kind == FrameKind::Hello => envelope,
        _ => {
            warn!("relay peer did not start with hello");
            return;
        }
    };
    let Some(peer_id) = hello.frame.from_peer_id.clone() else {
        warn!("hello frame without fromPeerId");
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<WireFrame>();
    let existing: Vec<String> = {
        let mut peers = state.peers.lock();
        let existing = peers.keys().cloned().collect();
        peers.insert(peer_id.clone(), tx);
        existing
    };
    info!(peer = %peer_id, "relay peer joined");

    // Introduce the newcomer to the mesh and vice versa.
    state.route(
        RelayEnvelope {
            to: None,
            frame: WireFrame::hello(&peer_id),
        },
        &peer_id,
    );
    {
        let peers = state.peers.lock();
        if let Some(tx) = peers.get(&peer_id) {
            for other in existing {
                let _ = tx.send(WireFrame::hello(&other));
            }
        }
    }

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_json(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    });

    loop {
        match read_json::<RelayEnvelope>(&mut reader).await {
            Ok(Some(envelope)) => state.route(envelope, &peer_id),
            Ok(None) => break,
            Err(e) => {
                warn!(peer = %peer_id, error = %e, "relay read failed");
                break;
            }
        }
    }

    state.peers.lock().remove(&peer_id);
    writer_task.abort();
    info!(peer = %peer_id, "relay peer left");
    state.route(
        RelayEnvelope {
            to: None,
            frame: WireFrame::bye(&peer_id),
        },
        &peer_id,
    );
}

/// A peer's connection to a relay.
pub struct RelayTransport {
    peer_id: String,
    out: mpsc::UnboundedSender<RelayEnvelope>,
}

impl RelayTransport {
    /// Connects to a relay, announces the peer, and starts routing
    /// incoming frames onto the bus.
    pub async fn connect(addr: SocketAddr, peer_id: &str, bus: EventBus) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (mut reader, mut writer) = stream.into_split();
        let (out, mut out_rx) = mpsc::unbounded_channel::<RelayEnvelope>();

        out.send(RelayEnvelope {
            to: None,
            frame: WireFrame::hello(peer_id),
        })
        .map_err(|_| TransportError::Closed("relay writer gone".into()))?;

        tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                if write_json(&mut writer, &envelope).await.is_err() {
                    break;
                }
            }
        });

        let reader_bus = bus;
        let local_id = peer_id.to_string();
        tokio::spawn(async move {
            loop {
                match read_json::<WireFrame>(&mut reader).await {
                    Ok(Some(frame)) => deliver(&reader_bus, &local_id, frame),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "relay client read failed");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            peer_id: peer_id.to_string(),
            out,
        })
    }
}

/// Routes a relay-delivered frame onto the local bus.
pub(crate) fn deliver(bus: &EventBus, local_id: &str, frame: WireFrame) {
    let from = frame.from_peer_id.clone().unwrap_or_default();
    if from == local_id {
        return;
    }
    match frame.kind {
        FrameKind::Hello => bus.emit(
            PEER_CONNECTED_TOPIC,
            serde_json::json!({ "peerId": from }),
        ),
        FrameKind::Bye => bus.emit(
            PEER_DISCONNECTED_TOPIC,
            serde_json::json!({ "peerId": from }),
        ),
        FrameKind::Sync | FrameKind::Signal => bus.emit(
            NET_FRAME_TOPIC,
            serde_json::json!({ "from": from, "frame": frame }),
        ),
    }
}

impl Transport for RelayTransport {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    fn send(&self, to: &str, frame: WireFrame) -> Result<()> {
        self.out
            .send(RelayEnvelope {
                to: Some(to.to_string()),
                frame,
            })
            .map_err(|_| TransportError::Closed("relay connection closed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    fn frame_sink(bus: &EventBus, topic: &str) -> Arc<PMutex<Vec<serde_json::Value>>> {
        let seen = Arc::new(PMutex::new(Vec::new()));
        let sink = seen.clone();
        bus.on(topic, move |e| sink.lock().push(e.payload.clone()))
            .detach();
        seen
    }

    #[tokio::test]
    async fn test_relay_announces_peers() {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let bus_a = EventBus::new();
        let connected_a = frame_sink(&bus_a, PEER_CONNECTED_TOPIC);

        let _a = RelayTransport::connect(server.local_addr(), "peer-a", bus_a)
            .await
            .unwrap();
        let bus_b = EventBus::new();
        let connected_b = frame_sink(&bus_b, PEER_CONNECTED_TOPIC);
        let _b = RelayTransport::connect(server.local_addr(), "peer-b", bus_b)
            .await
            .unwrap();
        settle().await;

        assert_eq!(connected_a.lock()[0]["peerId"], "peer-b");
        assert_eq!(connected_b.lock()[0]["peerId"], "peer-a");
    }

    #[tokio::test]
    async fn test_relay_forwards_addressed_frames() {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let a = RelayTransport::connect(server.local_addr(), "peer-a", EventBus::new())
            .await
            .unwrap();
        let bus_b = EventBus::new();
        let frames_b = frame_sink(&bus_b, NET_FRAME_TOPIC);
        let _b = RelayTransport::connect(server.local_addr(), "peer-b", bus_b)
            .await
            .unwrap();
        settle().await;

        a.send("peer-b", WireFrame::sync("peer-a", b"hello-sync"))
            .unwrap();
        settle().await;

        let frames = frames_b.lock();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["from"], "peer-a");
        let frame: WireFrame = serde_json::from_value(frames[0]["frame"].clone()).unwrap();
        assert_eq!(frame.sync_data().unwrap(), b"hello-sync");
    }

    #[tokio::test]
    async fn test_relay_disconnect_announces_bye() {
        let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
        let bus_a = EventBus::new();
        let gone = frame_sink(&bus_a, PEER_DISCONNECTED_TOPIC);
        let _a = RelayTransport::connect(server.local_addr(), "peer-a", bus_a)
            .await
            .unwrap();

        let b = RelayTransport::connect(server.local_addr(), "peer-b", EventBus::new())
            .await
            .unwrap();
        settle().await;
        drop(b);
        settle().await;

        assert_eq!(gone.lock()[0]["peerId"], "peer-b");
    }
}
