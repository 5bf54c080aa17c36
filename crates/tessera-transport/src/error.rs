//! Error types for transport operations.

use thiserror::Error;

/// Transport-layer failures; fatal to a single peer link, never to the
/// local engine.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport (or its backing connection) is closed.
    #[error("transport closed: {0}")]
    Closed(String),

    /// The addressed peer is not reachable.
    #[error("peer gone: {0}")]
    PeerGone(String),

    /// A frame failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(String),

    /// Underlying socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
