//! Peer-to-peer transports behind one capability set.
//!
//! A [`Transport`] can name its local peer and send a [`WireFrame`] to a
//! remote peer; incoming traffic surfaces on the local event bus as
//! `net:frame`, `net:peer-connected`, and `net:peer-disconnected` events.
//! Three implementations: a synchronous in-memory mesh for tests and local
//! simulation, a central TCP relay, and direct peer channels negotiated
//! through relay signaling.

mod direct;
mod error;
mod frame;
mod memory;
mod relay;

pub use direct::DirectTransport;
pub use error::TransportError;
pub use frame::{FrameKind, WireFrame};
pub use memory::{MemoryHub, MemoryTransport};
pub use relay::{RelayServer, RelayTransport};

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Topic carrying incoming frames: payload `{from, frame}`.
pub const NET_FRAME_TOPIC: &str = "net:frame";

/// Topic announcing a connected peer: payload `{peerId}`.
pub const PEER_CONNECTED_TOPIC: &str = "net:peer-connected";

/// Topic announcing a disconnected peer: payload `{peerId}`.
pub const PEER_DISCONNECTED_TOPIC: &str = "net:peer-disconnected";

/// The capability set every transport provides.
pub trait Transport: Send + Sync {
    /// The local peer id.
    fn peer_id(&self) -> &str;

    /// Sends a frame to one remote peer.
    fn send(&self, to: &str, frame: WireFrame) -> Result<()>;
}
