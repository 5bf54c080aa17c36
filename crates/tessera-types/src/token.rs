//! The atomic token value type.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Free-form metadata attached to tokens and placements.
///
/// Values are plain JSON data; no references survive insertion into the
/// Chronicle document.
pub type Metadata = HashMap<String, serde_json::Value>;

/// The atomic unit of game state.
///
/// Tokens are value objects: equality and hashing are by `id` only. They are
/// cloned on insertion into the Chronicle, so no shared mutable alias exists
/// across the CRDT boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    /// Unique identifier.
    pub id: String,
    /// Display label.
    #[serde(default)]
    pub label: String,
    /// Ordering index within the original set.
    #[serde(default)]
    pub index: i64,
    /// Optional grouping (suit, faction, color).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Token kind discriminator.
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Single-glyph representation.
    #[serde(rename = "char", default = "default_glyph")]
    pub glyph: String,
    /// Free text carried by the token.
    #[serde(default)]
    pub text: String,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub meta: Metadata,
}

fn default_kind() -> String {
    "default".to_string()
}

fn default_glyph() -> String {
    "\u{25A1}".to_string()
}

impl Token {
    /// Creates a token with the given id and index, defaulting other fields.
    pub fn new(id: impl Into<String>, index: i64) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            index,
            group: None,
            kind: default_kind(),
            glyph: default_glyph(),
            text: String::new(),
            meta: Metadata::new(),
        }
    }

    /// Sets the display label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Sets the grouping.
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Sets the kind discriminator.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Attaches a metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Token {}

impl std::hash::Hash for Token {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.label, self.id)
    }
}
