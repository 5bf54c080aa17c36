//! The worker wire protocol.
//!
//! Frames cross the worker boundary in explicitly serialized form: the
//! chronicle travels as base64 of its binary save, actions and results as
//! plain JSON. No shared mutable memory is assumed.

use serde::{Deserialize, Serialize};

use tessera_types::Action;

/// One step's outcome inside a batch reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FrameResult {
    /// Handler succeeded.
    Ok {
        /// Handler result value.
        result: serde_json::Value,
    },
    /// Handler failed.
    Err {
        /// Stable error kind tag.
        kind: String,
        /// Human-readable message.
        message: String,
    },
}

/// Frames exchanged between the main side and the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// Main to worker: serialized chronicle plus registry manifest.
    Init {
        /// Base64 of the chronicle's binary save.
        chronicle: String,
        /// Names of the action packs the mirror registry carries.
        packs: Vec<String>,
    },
    /// Worker to main: mirror engine is ready; queued dispatches may flow.
    InitOk,
    /// Liveness probe.
    Ping {
        /// Request id.
        id: u64,
        /// Millis at send time.
        sent_at: i64,
    },
    /// Probe reply carrying both timestamps for round-trip measurement.
    Pong {
        /// Request id echoed.
        id: u64,
        /// Millis the ping was sent.
        sent_at: i64,
        /// Millis the worker replied.
        replied_at: i64,
    },
    /// Main to worker: apply one action.
    Dispatch {
        /// Request id.
        id: u64,
        /// The action to apply.
        action: Action,
    },
    /// Worker to main: the action was applied.
    DispatchOk {
        /// Request id echoed.
        id: u64,
        /// Handler result.
        result: serde_json::Value,
        /// Chronicle changes committed while applying.
        changes: u64,
    },
    /// Worker to main: the action failed; the mirror state is unchanged.
    DispatchErr {
        /// Request id echoed.
        id: u64,
        /// Stable error kind tag.
        kind: String,
        /// Human-readable message.
        message: String,
    },
    /// Main to worker: apply a coalesced batch in order.
    Batch {
        /// Request id.
        id: u64,
        /// Actions in dispatch order.
        actions: Vec<Action>,
    },
    /// Worker to main: per-step outcomes, in order.
    BatchOk {
        /// Request id echoed.
        id: u64,
        /// One outcome per submitted action.
        results: Vec<FrameResult>,
    },
    /// Main to worker: request the mirror chronicle's current save.
    Snapshot {
        /// Request id.
        id: u64,
    },
    /// Worker to main: the mirror chronicle, serialized.
    SnapshotOk {
        /// Request id echoed.
        id: u64,
        /// Base64 of the chronicle's binary save.
        chronicle: String,
    },
    /// Worker to main: a domain event pushed from the mirror engine.
    Event {
        /// Bus topic on the worker side.
        topic: String,
        /// Event payload.
        payload: serde_json::Value,
    },
    /// Main to worker: stop the mirror engine.
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_are_tagged() {
        let frame = WorkerFrame::Dispatch {
            id: 7,
            action: Action::new("stack:draw"),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"type\":\"dispatch\""));

        let back: WorkerFrame = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, WorkerFrame::Dispatch { id: 7, .. }));
    }

    #[test]
    fn test_frame_result_roundtrip() {
        let results = vec![
            FrameResult::Ok {
                result: serde_json::json!({"n": 1}),
            },
            FrameResult::Err {
                kind: "illegal_move".into(),
                message: "stack empty".into(),
            },
        ];
        let json = serde_json::to_string(&results).unwrap();
        let back: Vec<FrameResult> = serde_json::from_str(&json).unwrap();
        assert!(matches!(back[0], FrameResult::Ok { .. }));
        assert!(matches!(back[1], FrameResult::Err { .. }));
    }

    #[test]
    fn test_shutdown_frame_shape() {
        let json = serde_json::to_string(&WorkerFrame::Shutdown).unwrap();
        assert_eq!(json, "{\"type\":\"shutdown\"}");
    }
}
