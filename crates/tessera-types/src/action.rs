//! The action record driving the engine's dispatch pipeline.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::now_millis;

/// Unique identifier of an applied action.
pub type ActionId = String;

/// An immutable action record.
///
/// `kind` is a namespaced string such as `stack:draw`; the payload is plain
/// JSON. Equality is by `id`. Actions are appended to the engine-local
/// history when applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Namespaced action type (`stack:draw`, `space:place`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// JSON payload; schema is per action type.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Unique id, assigned at dispatch if missing.
    #[serde(default)]
    pub id: ActionId,
    /// Milliseconds since epoch, assigned at dispatch if missing.
    #[serde(default)]
    pub timestamp: i64,
}

impl Action {
    /// Creates an action with an empty payload.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: serde_json::Value::Null,
            id: String::new(),
            timestamp: 0,
        }
    }

    /// Creates an action with the given payload.
    pub fn with_payload(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            id: String::new(),
            timestamp: 0,
        }
    }

    /// Fills in id and timestamp if they are missing.
    pub fn normalize(&mut self) {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        if self.timestamp == 0 {
            self.timestamp = now_millis();
        }
    }

    /// The namespace portion of the action type (`stack` in `stack:draw`).
    pub fn namespace(&self) -> &str {
        self.kind.split(':').next().unwrap_or("")
    }
}

impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Action {}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_assigns_id_and_timestamp() {
        let mut action = Action::new("stack:draw");
        assert!(action.id.is_empty());

        action.normalize();
        assert!(!action.id.is_empty());
        assert!(action.timestamp > 0);

        // Normalizing again keeps the assigned values.
        let id = action.id.clone();
        let ts = action.timestamp;
        action.normalize();
        assert_eq!(action.id, id);
        assert_eq!(action.timestamp, ts);
    }

    #[test]
    fn test_equality_is_by_id() {
        let mut a = Action::new("stack:draw");
        let mut b = Action::new("stack:burn");
        a.normalize();
        b.normalize();
        assert_ne!(a, b);

        b.id = a.id.clone();
        assert_eq!(a, b);
    }

    #[test]
    fn test_namespace() {
        assert_eq!(Action::new("stack:draw").namespace(), "stack");
        assert_eq!(Action::new("debug:log").namespace(), "debug");
        assert_eq!(Action::new("plain").namespace(), "plain");
    }

    #[test]
    fn test_serializes_with_type_tag() {
        let action = Action::with_payload("stack:draw", serde_json::json!({"count": 2}));
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"type\":\"stack:draw\""));

        let back: Action = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, "stack:draw");
        assert_eq!(back.payload["count"], 2);
    }
}
