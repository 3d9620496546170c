//! The JSON frame envelope exchanged over the streaming transport.

use serde::{Deserialize, Serialize};

/// The closed set of frame kinds the transport understands, plus a
/// catch-all so unrecognised types are ignored rather than rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    /// A request to the server to diff state and send back what's missing.
    SyncRequest,
    /// The server's answer to a `sync_request`.
    SyncResponse,
    /// A CRDT update for one note.
    Update,
    /// A metadata change for one note.
    NoteMetadata,
    /// Reserved for future presence/awareness; accepted and discarded.
    Awareness,
    /// Start receiving update frames for a note.
    Subscribe,
    /// Stop receiving update frames for a note.
    Unsubscribe,
    /// Anything not in the closed set above. Forward-compatible: the client
    /// ignores these rather than tearing down the connection.
    #[serde(other)]
    Other,
}

/// One frame of the wire protocol: `{ type, note_id?, payload }`.
///
/// `payload` is either base64-encoded CRDT bytes or a JSON object
/// serialized to a string, depending on `frame_type`; the transport does
/// not interpret it beyond routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

impl Frame {
    /// Build a `subscribe` frame for `note_id`.
    pub fn subscribe(note_id: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::Subscribe,
            note_id: Some(note_id.into()),
            payload: None,
        }
    }

    /// Build an `unsubscribe` frame for `note_id`.
    pub fn unsubscribe(note_id: impl Into<String>) -> Self {
        Self {
            frame_type: FrameType::Unsubscribe,
            note_id: Some(note_id.into()),
            payload: None,
        }
    }

    /// Build an `update` frame carrying a base64-encoded CRDT update.
    pub fn update(note_id: impl Into<String>, payload_b64: String) -> Self {
        Self {
            frame_type: FrameType::Update,
            note_id: Some(note_id.into()),
            payload: Some(payload_b64),
        }
    }

    /// Build a `note_metadata` frame carrying a JSON-encoded metadata entry.
    pub fn note_metadata(note_id: impl Into<String>, payload_json: String) -> Self {
        Self {
            frame_type: FrameType::NoteMetadata,
            note_id: Some(note_id.into()),
            payload: Some(payload_json),
        }
    }

    /// Build a `sync_request` frame carrying a JSON-encoded request body.
    pub fn sync_request(payload_json: String) -> Self {
        Self {
            frame_type: FrameType::SyncRequest,
            note_id: None,
            payload: Some(payload_json),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_frame_type_deserializes_to_other() {
        let json = r#"{"type":"presence_ping","note_id":"n1"}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.frame_type, FrameType::Other);
    }

    #[test]
    fn subscribe_frame_round_trips() {
        let frame = Frame::subscribe("n1");
        let json = serde_json::to_string(&frame).unwrap();
        let back: Frame = serde_json::from_str(&json).unwrap();
        assert_eq!(frame, back);
    }

    #[test]
    fn awareness_frame_parses_without_payload() {
        let json = r#"{"type":"awareness"}"#;
        let frame: Frame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.frame_type, FrameType::Awareness);
        assert!(frame.payload.is_none());
    }
}
