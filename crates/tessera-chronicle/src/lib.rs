//! The Chronicle: a CRDT document with change events and cross-peer merge.
//!
//! The document is the single source of truth for all game state. Local
//! mutations go through [`Chronicle::change`]; remote state arrives through
//! the per-peer sync API. Every committed change emits exactly one
//! `state:changed` event carrying the origin tag (`"local"` for local
//! mutations, a peer id for remote applications) that the consensus layer
//! uses to prevent echo loops.

mod chronicle;
mod doc;
mod error;

pub use chronicle::{Chronicle, ChronicleMetrics, SyncCursor, LOCAL_SOURCE, STATE_CHANGED_TOPIC};
pub use doc::{flatten_doc, unflatten_doc, DocDraft};
pub use error::ChronicleError;

/// Result type for chronicle operations.
pub type Result<T> = std::result::Result<T, ChronicleError>;
