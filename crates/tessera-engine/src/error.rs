//! Error types surfaced at the dispatch boundary.

use thiserror::Error;

use tessera_board::BoardError;
use tessera_chronicle::ChronicleError;

/// Errors returned by dispatch and the pipeline around it.
///
/// Handler failures never terminate the engine: they are returned to the
/// caller and mirrored on a typed event.
#[derive(Debug, Error)]
pub enum EngineError {
    /// No handler and no catch-all handler for the action type.
    #[error("unknown action: {0}")]
    UnknownAction(String),

    /// The handler rejected its payload.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// A domain precondition failed (empty stack, locked zone, unknown
    /// placement).
    #[error("illegal move: {0}")]
    IllegalMove(String),

    /// An agent transfer or trade lacked the required resources.
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    /// A request expired before its result arrived.
    #[error("timed out: {0}")]
    TimedOut(String),

    /// A handler panicked; the panic was captured and the action was not
    /// applied.
    #[error("handler panicked: {0}")]
    Panic(String),

    /// Underlying chronicle failure.
    #[error(transparent)]
    Chronicle(#[from] ChronicleError),
}

impl EngineError {
    /// A stable kind tag, used in error events and worker frames.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::UnknownAction(_) => "unknown_action",
            EngineError::InvalidPayload(_) => "invalid_payload",
            EngineError::IllegalMove(_) => "illegal_move",
            EngineError::InsufficientResources(_) => "insufficient_resources",
            EngineError::TimedOut(_) => "timed_out",
            EngineError::Panic(_) => "panic",
            EngineError::Chronicle(_) => "chronicle",
        }
    }

    /// Rebuilds an error from its kind tag and message, as carried in a
    /// worker frame.
    pub fn from_kind(kind: &str, message: &str) -> Self {
        let message = message.to_string();
        match kind {
            "unknown_action" => EngineError::UnknownAction(message),
            "invalid_payload" => EngineError::InvalidPayload(message),
            "illegal_move" => EngineError::IllegalMove(message),
            "insufficient_resources" => EngineError::InsufficientResources(message),
            "timed_out" => EngineError::TimedOut(message),
            "chronicle" => EngineError::Chronicle(ChronicleError::Corrupt(message)),
            _ => EngineError::Panic(message),
        }
    }
}

impl From<BoardError> for EngineError {
    fn from(err: BoardError) -> Self {
        match err {
            BoardError::InsufficientResources(msg) => EngineError::InsufficientResources(msg),
            BoardError::Chronicle(inner) => EngineError::Chronicle(inner),
            other => EngineError::IllegalMove(other.to_string()),
        }
    }
}
