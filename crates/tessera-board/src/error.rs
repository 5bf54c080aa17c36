//! Error types for board operations.

use thiserror::Error;

/// Domain-level failures; callers recover, the engine never terminates.
#[derive(Debug, Error)]
pub enum BoardError {
    /// Draw asked for more tokens than remain.
    #[error("stack empty: requested {requested}, {remaining} remaining")]
    StackEmpty { requested: usize, remaining: usize },

    /// Index outside the live stack.
    #[error("index out of bounds: {0}")]
    IndexOutOfBounds(usize),

    /// The zone rejects place/move/remove while locked.
    #[error("zone locked: {0}")]
    ZoneLocked(String),

    /// No such zone.
    #[error("zone not found: {0}")]
    ZoneNotFound(String),

    /// No such placement within the zone.
    #[error("placement not found: {zone}/{id}")]
    PlacementNotFound { zone: String, id: String },

    /// No such agent record.
    #[error("agent not found: {0}")]
    AgentNotFound(String),

    /// No such token in the relevant pile.
    #[error("token not found: {0}")]
    TokenNotFound(String),

    /// Agent transfer or trade lacked the required resources.
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    /// The source has no constituent stacks.
    #[error("source has no stacks")]
    EmptySource,

    /// Underlying chronicle failure.
    #[error(transparent)]
    Chronicle(#[from] tessera_chronicle::ChronicleError),
}
