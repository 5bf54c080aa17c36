//! Document state records.
//!
//! These are the plain-data shapes stored under the reserved Chronicle keys.
//! Every cached in-memory field on a domain object is recomputable from
//! these records; the document is the single source of truth.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Metadata, Token};

/// Compartments of a stack: the live deck plus drawn and discarded tokens.
///
/// Until `reset`, the multiset union of the three compartments equals the
/// initial token set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StackState {
    /// The live deck; the top of the deck is the end of the vector.
    #[serde(default)]
    pub stack: Vec<Token>,
    /// Tokens removed by draw.
    #[serde(default)]
    pub drawn: Vec<Token>,
    /// Tokens removed by burn or explicit discard.
    #[serde(default)]
    pub discards: Vec<Token>,
    /// Seed captured by the most recent shuffle, for replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
}

impl StackState {
    /// Total tokens across all compartments.
    pub fn total(&self) -> usize {
        self.stack.len() + self.drawn.len() + self.discards.len()
    }
}

/// A token instance positioned inside a zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacementRecord {
    /// Unique within the space, stable across moves.
    pub id: String,
    /// Id of the placed token.
    pub token_id: String,
    /// Snapshot of the token at placement time.
    pub token: Token,
    /// Horizontal coordinate, unitless.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    /// Vertical coordinate, unitless.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    /// Rotation in degrees.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<f64>,
    /// Whether the token is face up.
    #[serde(default)]
    pub face_up: bool,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub meta: Metadata,
}

/// A named ordered sequence of placements.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneState {
    /// Placements in insertion order unless explicitly reordered.
    #[serde(default)]
    pub placements: Vec<PlacementRecord>,
    /// A locked zone rejects place/move/remove.
    #[serde(default)]
    pub locked: bool,
    /// Default `face_up` for new placements in this zone.
    #[serde(default = "default_face_up")]
    pub face_up_default: bool,
}

fn default_face_up() -> bool {
    true
}

/// When the source reshuffles discards back into play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReshuffleMode {
    /// Reshuffle automatically once the threshold is crossed.
    Auto,
    /// Emit `source:reshuffle-needed` and take no action.
    Manual,
}

/// Reshuffle policy for a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReshufflePolicy {
    /// Reshuffle when total remaining live tokens is at or below this.
    pub threshold: usize,
    /// Automatic or manual.
    pub mode: ReshuffleMode,
}

impl Default for ReshufflePolicy {
    fn default() -> Self {
        Self {
            threshold: 0,
            mode: ReshuffleMode::Auto,
        }
    }
}

/// The source record: a union view over an ordered list of stacks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceState {
    /// Document keys of the constituent stacks, in draw order.
    #[serde(default)]
    pub stack_keys: Vec<String>,
    /// Index of the stack currently being drawn from.
    #[serde(default)]
    pub cursor: usize,
    /// Reshuffle policy.
    #[serde(default)]
    pub policy: ReshufflePolicy,
    /// Seed used to fork per-constituent reshuffle seeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
}

/// A participant record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    /// Unique agent id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Ordered hand of tokens.
    #[serde(default)]
    pub inventory: Vec<Token>,
    /// Personal discard pile.
    #[serde(default)]
    pub discard: Vec<Token>,
    /// Completed turn count.
    #[serde(default)]
    pub turns: u64,
    /// Whether the agent is currently taking its turn.
    #[serde(default)]
    pub active: bool,
    /// Document key of an owned private stack, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_key: Option<String>,
    /// Name of a space shared with other agents, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space: Option<String>,
    /// Named numeric resources (chips, bankroll, energy).
    #[serde(default)]
    pub resources: HashMap<String, i64>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub meta: Metadata,
}

impl AgentState {
    /// Creates an agent record with empty piles.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            inventory: Vec::new(),
            discard: Vec::new(),
            turns: 0,
            active: false,
            stack_key: None,
            space: None,
            resources: HashMap::new(),
            meta: Metadata::new(),
        }
    }
}

/// Replicated rule state: which once-policies have fired, and when.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleState {
    /// Policy name to firing timestamp (millis).
    #[serde(default)]
    pub fired: HashMap<String, i64>,
}

/// The turn/game-loop record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoopState {
    /// Completed turn count across all agents.
    #[serde(default)]
    pub turn: u64,
    /// Whether the loop is running.
    #[serde(default)]
    pub running: bool,
    /// Id of the agent whose turn it is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_agent: Option<String>,
    /// Embedder-defined phase label.
    #[serde(default)]
    pub phase: String,
    /// Turn limit, 0 for unlimited.
    #[serde(default)]
    pub max_turns: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_state_total() {
        let mut s = StackState::default();
        s.stack = vec![Token::new("a", 0), Token::new("b", 1)];
        s.drawn = vec![Token::new("c", 2)];
        assert_eq!(s.total(), 3);
    }

    #[test]
    fn test_zone_state_defaults_face_up() {
        let z: ZoneState = serde_json::from_str("{}").unwrap();
        assert!(z.face_up_default);
        assert!(!z.locked);
        assert!(z.placements.is_empty());
    }

    #[test]
    fn test_reshuffle_mode_serialization() {
        assert_eq!(
            serde_json::to_string(&ReshuffleMode::Auto).unwrap(),
            "\"auto\""
        );
        let mode: ReshuffleMode = serde_json::from_str("\"manual\"").unwrap();
        assert_eq!(mode, ReshuffleMode::Manual);
    }

    #[test]
    fn test_agent_state_roundtrip() {
        let mut a = AgentState::new("p1", "Alice");
        a.resources.insert("bankroll".into(), 100);
        let json = serde_json::to_value(&a).unwrap();
        let back: AgentState = serde_json::from_value(json).unwrap();
        assert_eq!(back.id, "p1");
        assert_eq!(back.resources["bankroll"], 100);
    }

    #[test]
    fn test_rule_state_default_empty() {
        let r: RuleState = serde_json::from_str("{}").unwrap();
        assert!(r.fired.is_empty());
    }
}
