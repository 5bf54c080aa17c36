//! Stateful domain objects projected into the Chronicle document.
//!
//! A [`Stack`] is an ordered deck with draw/shuffle/burn/discard semantics,
//! a [`Space`] holds positioned placements in named zones, a [`Source`] is a
//! union view over several stacks with a reshuffle policy, and an [`Agent`]
//! is a named participant with an inventory and a turn lifecycle. Every
//! mutation is one atomic Chronicle change; every read is a projection of
//! the document, which remains the single source of truth.

mod agent;
mod error;
mod source;
mod space;
mod stack;

pub use agent::{steal, trade, transfer, Agent, TradeOffer, TransferOutcome, TransferSpec};
pub use error::BoardError;
pub use source::Source;
pub use space::{PlaceOptions, Space, SpreadPattern};
pub use stack::Stack;

/// Result type for board operations.
pub type Result<T> = std::result::Result<T, BoardError>;
