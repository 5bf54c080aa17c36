//! Action log recording and replay.
//!
//! The recorder appends a `{type, payload, timestamp}` tuple for every
//! applied action. Replaying the log against a fresh engine with the same
//! seeds yields an equal Chronicle state, because nondeterministic shuffle
//! seeds are captured into payloads at dispatch time.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tessera_events::Subscription;
use tessera_types::Action;

use crate::{DispatchResult, Engine, EngineError, Result};

/// One recorded action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderEntry {
    /// Action type.
    #[serde(rename = "type")]
    pub kind: String,
    /// Payload as applied (including captured seeds).
    pub payload: serde_json::Value,
    /// Dispatch timestamp, millis.
    pub timestamp: i64,
}

/// Records every applied action on an engine.
pub struct Recorder {
    entries: Arc<Mutex<Vec<RecorderEntry>>>,
    _subscription: Subscription,
}

impl Recorder {
    /// Starts recording; recording stops when the recorder is dropped.
    pub fn attach(engine: &Engine) -> Self {
        let entries = Arc::new(Mutex::new(Vec::new()));
        let sink = entries.clone();
        let subscription = engine.bus().on("engine:action", move |event| {
            let action = &event.payload["action"];
            let Some(kind) = action["type"].as_str() else {
                return;
            };
            sink.lock().push(RecorderEntry {
                kind: kind.to_string(),
                payload: action["payload"].clone(),
                timestamp: action["timestamp"].as_i64().unwrap_or(0),
            });
        });
        Self {
            entries,
            _subscription: subscription,
        }
    }

    /// Snapshot of the log so far.
    pub fn log(&self) -> Vec<RecorderEntry> {
        self.entries.lock().clone()
    }

    /// Number of recorded actions.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Serializes the log as a JSON array.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.log())
            .map_err(|e| EngineError::InvalidPayload(e.to_string()))
    }

    /// Parses a log from its JSON form.
    pub fn from_json(text: &str) -> Result<Vec<RecorderEntry>> {
        serde_json::from_str(text).map_err(|e| EngineError::InvalidPayload(e.to_string()))
    }
}

/// Replays a recorded log against an engine, in order.
pub fn replay(engine: &Engine, log: &[RecorderEntry]) -> Vec<DispatchResult> {
    log.iter()
        .map(|entry| {
            engine.dispatch(Action {
                kind: entry.kind.clone(),
                payload: entry.payload.clone(),
                id: String::new(),
                timestamp: entry.timestamp,
            })
        })
        .collect()
}
