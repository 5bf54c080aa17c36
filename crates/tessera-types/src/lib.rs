//! Common types used throughout `tessera`.
//!
//! This crate provides the value types stored in the Chronicle document
//! (tokens, placements, compartment records), the action record that drives
//! the engine, and the seeded PRNG that all game-visible randomness flows
//! through.

mod action;
mod rng;
mod state;
mod token;

pub use action::{Action, ActionId};
pub use rng::{hash_seed, Mulberry32};
pub use state::{
    AgentState, LoopState, PlacementRecord, ReshuffleMode, ReshufflePolicy, RuleState,
    SourceState, StackState, ZoneState,
};
pub use token::{Metadata, Token};

use std::time::{SystemTime, UNIX_EPOCH};

/// Document key holding the default stack compartments.
pub const STACK_KEY: &str = "stack";

/// Document key holding the source (multi-stack union) record.
pub const SOURCE_KEY: &str = "source";

/// Document key holding replicated rule state (fired once-policies).
pub const RULES_KEY: &str = "rules";

/// Document key holding the turn/game-loop record.
pub const LOOP_KEY: &str = "loop";

/// Prefix for per-zone document keys (`zone:{name}`).
pub const ZONE_PREFIX: &str = "zone:";

/// Prefix for per-agent document keys (`agent:{id}`).
pub const AGENT_PREFIX: &str = "agent:";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
