//! Wire frames shared by all transports.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::{Result, TransportError};

/// Frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    /// CRDT sync payload (base64 binary in `data`).
    #[serde(rename = "sync")]
    Sync,
    /// A peer announces itself.
    #[serde(rename = "peer:hello")]
    Hello,
    /// A peer leaves.
    #[serde(rename = "peer:bye")]
    Bye,
    /// Transport signaling (direct-channel negotiation).
    #[serde(rename = "signal")]
    Signal,
}

/// A self-delimited frame: `{type, fromPeerId?, data?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    /// Frame type.
    #[serde(rename = "type")]
    pub kind: FrameKind,
    /// Originating peer.
    #[serde(rename = "fromPeerId", default, skip_serializing_if = "Option::is_none")]
    pub from_peer_id: Option<String>,
    /// Base64 payload for `sync`, free text for `signal`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl WireFrame {
    /// A sync frame carrying binary CRDT data.
    pub fn sync(from: &str, bytes: &[u8]) -> Self {
        Self {
            kind: FrameKind::Sync,
            from_peer_id: Some(from.to_string()),
            data: Some(BASE64.encode(bytes)),
        }
    }

    /// A hello frame.
    pub fn hello(from: &str) -> Self {
        Self {
            kind: FrameKind::Hello,
            from_peer_id: Some(from.to_string()),
            data: None,
        }
    }

    /// A bye frame.
    pub fn bye(from: &str) -> Self {
        Self {
            kind: FrameKind::Bye,
            from_peer_id: Some(from.to_string()),
            data: None,
        }
    }

    /// A signaling frame with free-form data.
    pub fn signal(from: &str, data: &str) -> Self {
        Self {
            kind: FrameKind::Signal,
            from_peer_id: Some(from.to_string()),
            data: Some(data.to_string()),
        }
    }

    /// Decodes the binary payload of a sync frame.
    pub fn sync_data(&self) -> Result<Vec<u8>> {
        let data = self
            .data
            .as_deref()
            .ok_or_else(|| TransportError::Codec("sync frame without data".into()))?;
        BASE64
            .decode(data)
            .map_err(|e| TransportError::Codec(format!("bad sync payload: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_kind_wire_names() {
        assert_eq!(
            serde_json::to_string(&FrameKind::Hello).unwrap(),
            "\"peer:hello\""
        );
        assert_eq!(serde_json::to_string(&FrameKind::Sync).unwrap(), "\"sync\"");
    }

    #[test]
    fn test_sync_frame_roundtrip() {
        let frame = WireFrame::sync("peer-a", b"payload");
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains("\"fromPeerId\":\"peer-a\""));

        let back: WireFrame = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sync_data().unwrap(), b"payload");
    }

    #[test]
    fn test_sync_data_validation() {
        let mut frame = WireFrame::hello("p");
        assert!(frame.sync_data().is_err());

        frame.data = Some("@@@not-base64".into());
        assert!(matches!(
            frame.sync_data(),
            Err(TransportError::Codec(_))
        ));
    }
}
