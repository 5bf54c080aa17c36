//! Peer-to-peer sync over a transport.
//!
//! One [`ConsensusCore`] per local chronicle and transport. It holds a
//! per-peer sync cursor and implements the source-tagged broadcast rule
//! that prevents echo and cascade loops: changes tagged `"local"` go to
//! every peer, changes tagged with a peer id go to every peer except that
//! one.

mod core;

pub use core::{ConsensusCore, ConsensusMetrics};

/// Topic emitted when a malformed frame is dropped.
pub const BADFRAME_TOPIC: &str = "consensus:badframe";

/// Topic emitted when a peer's cursor is dropped.
pub const PEER_GONE_TOPIC: &str = "consensus:peer-gone";
