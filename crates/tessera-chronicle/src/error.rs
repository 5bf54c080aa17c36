//! Error types for chronicle operations.

use thiserror::Error;

/// Errors that can occur on the chronicle boundary.
#[derive(Debug, Error)]
pub enum ChronicleError {
    /// Load, merge, or sync input was malformed.
    #[error("chronicle corrupt: {0}")]
    Corrupt(String),

    /// A change mutator failed; its draft was discarded.
    #[error("change mutator failed: {0}")]
    Mutator(String),

    /// A stored record did not deserialize to the requested type.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The CRDT backend rejected an operation.
    #[error("document backend error: {0}")]
    Backend(String),
}
