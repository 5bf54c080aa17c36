//! Document shape helpers.
//!
//! The public document is a nested JSON mapping whose reserved keys are
//! `stack`, `zones`, `source`, `agents`, `rules`, `loop`, plus embedder
//! keys. In the CRDT it is stored as a flat root map of key to
//! JSON-serialized value, with the `zones` and `agents` subtrees broken out
//! one key per entry (`zone:{name}`, `agent:{id}`) so concurrent edits to
//! different entries merge cleanly per-key.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;

use tessera_types::{AGENT_PREFIX, ZONE_PREFIX};

use crate::{ChronicleError, Result};

/// Flattens the nested document into the flat key map stored in the CRDT.
pub fn flatten_doc(doc: &serde_json::Map<String, serde_json::Value>) -> BTreeMap<String, String> {
    let mut flat = BTreeMap::new();
    for (key, value) in doc {
        match key.as_str() {
            "zones" | "agents" => {
                let prefix = if key == "zones" { ZONE_PREFIX } else { AGENT_PREFIX };
                if let Some(entries) = value.as_object() {
                    for (name, entry) in entries {
                        flat.insert(format!("{prefix}{name}"), entry.to_string());
                    }
                }
            }
            _ => {
                flat.insert(key.clone(), value.to_string());
            }
        }
    }
    flat
}

/// Rebuilds the nested document from the flat key map.
pub fn unflatten_doc(flat: &BTreeMap<String, String>) -> serde_json::Map<String, serde_json::Value> {
    let mut doc = serde_json::Map::new();
    let mut zones = serde_json::Map::new();
    let mut agents = serde_json::Map::new();

    for (key, raw) in flat {
        let value: serde_json::Value =
            serde_json::from_str(raw).unwrap_or(serde_json::Value::Null);
        if let Some(name) = key.strip_prefix(ZONE_PREFIX) {
            zones.insert(name.to_string(), value);
        } else if let Some(id) = key.strip_prefix(AGENT_PREFIX) {
            agents.insert(id.to_string(), value);
        } else {
            doc.insert(key.clone(), value);
        }
    }

    if !zones.is_empty() {
        doc.insert("zones".to_string(), serde_json::Value::Object(zones));
    }
    if !agents.is_empty() {
        doc.insert("agents".to_string(), serde_json::Value::Object(agents));
    }
    doc
}

/// A mutable draft of the flat document, handed to change mutators.
///
/// Mutations touch only the draft; the chronicle diffs it against the
/// committed state when the mutator returns successfully.
#[derive(Debug)]
pub struct DocDraft {
    flat: BTreeMap<String, String>,
}

impl DocDraft {
    pub(crate) fn new(flat: BTreeMap<String, String>) -> Self {
        Self { flat }
    }

    pub(crate) fn into_flat(self) -> BTreeMap<String, String> {
        self.flat
    }

    /// Reads a typed record stored under a flat key.
    pub fn get_record<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.flat.get(key) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    /// Reads a typed record, falling back to its default when absent.
    pub fn get_record_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T> {
        Ok(self.get_record(key)?.unwrap_or_default())
    }

    /// Writes a typed record under a flat key.
    pub fn put_record<T: Serialize>(&mut self, key: &str, record: &T) -> Result<()> {
        let raw = serde_json::to_string(record)?;
        self.flat.insert(key.to_string(), raw);
        Ok(())
    }

    /// Removes a flat key; returns whether it was present.
    pub fn remove(&mut self, key: &str) -> bool {
        self.flat.remove(key).is_some()
    }

    /// Whether a flat key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.flat.contains_key(key)
    }

    /// Flat keys currently in the draft, in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.flat.keys().map(|k| k.as_str())
    }

    /// Reads the draft as the nested public document.
    pub fn to_document(&self) -> serde_json::Map<String, serde_json::Value> {
        unflatten_doc(&self.flat)
    }

    /// Replaces the entire draft with a nested document.
    pub fn replace_with(&mut self, doc: &serde_json::Map<String, serde_json::Value>) {
        self.flat = flatten_doc(doc);
    }
}

/// Maps a mutator failure message into the chronicle error space.
pub(crate) fn mutator_error(message: impl Into<String>) -> ChronicleError {
    ChronicleError::Mutator(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> serde_json::Map<String, serde_json::Value> {
        serde_json::from_value(serde_json::json!({
            "stack": {"stack": [], "drawn": [], "discards": []},
            "zones": {
                "center": {"placements": [], "locked": false},
                "hand": {"placements": [], "locked": true},
            },
            "agents": {
                "p1": {"id": "p1", "name": "Alice"},
            },
            "rules": {"fired": {}},
        }))
        .map(|v: serde_json::Value| v.as_object().cloned().unwrap())
        .unwrap()
    }

    #[test]
    fn test_flatten_breaks_out_zone_and_agent_keys() {
        let flat = flatten_doc(&sample_doc());
        assert!(flat.contains_key("stack"));
        assert!(flat.contains_key("rules"));
        assert!(flat.contains_key("zone:center"));
        assert!(flat.contains_key("zone:hand"));
        assert!(flat.contains_key("agent:p1"));
        assert!(!flat.contains_key("zones"));
        assert!(!flat.contains_key("agents"));
    }

    #[test]
    fn test_unflatten_inverts_flatten() {
        let doc = sample_doc();
        let back = unflatten_doc(&flatten_doc(&doc));
        assert_eq!(
            serde_json::Value::Object(back),
            serde_json::Value::Object(doc)
        );
    }

    #[test]
    fn test_draft_record_roundtrip() {
        let mut draft = DocDraft::new(BTreeMap::new());
        let state = tessera_types::StackState::default();
        draft.put_record("stack", &state).unwrap();

        let read: Option<tessera_types::StackState> = draft.get_record("stack").unwrap();
        assert!(read.is_some());
        assert!(draft.contains("stack"));
        assert!(draft.remove("stack"));
        assert!(!draft.contains("stack"));
    }

    #[test]
    fn test_draft_get_record_or_default() {
        let draft = DocDraft::new(BTreeMap::new());
        let state: tessera_types::RuleState = draft.get_record_or_default("rules").unwrap();
        assert!(state.fired.is_empty());
    }
}
