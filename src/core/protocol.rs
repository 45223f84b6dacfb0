//! Control protocol: the two JSON text frames bracketing a chunk stream.
//!
//! A file transfer on the data channel is `meta` → binary chunks → `end`.
//! Control frames travel as text messages; chunks as binary messages; the
//! channel's own text/binary distinction is the only framing needed.
//!
//! Decoding is defensive: malformed or unrecognized control frames are
//! dropped, never fatal — a buggy peer must not take down a healthy
//! session. Unknown `type` values are reserved for forward compatibility.

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::core::error::Result;

/// A control frame, JSON-encoded on the wire as
/// `{"type":"meta","id":…,"name":…,"size":…,"mime":…}` or
/// `{"type":"end","id":…}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlFrame {
    /// Announces a file; sent before its chunk stream.
    Meta {
        id: Uuid,
        name: String,
        size: u64,
        mime: String,
    },
    /// Marks the end of a file's chunk stream.
    End { id: Uuid },
}

/// Encode a control frame as a JSON text message.
pub fn encode_control(frame: &ControlFrame) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}

/// Decode an inbound text message into a control frame.
///
/// Returns `None` for malformed JSON and unknown frame types; the
/// caller drops those silently.
pub fn decode_control(text: &str) -> Option<ControlFrame> {
    match serde_json::from_str(text) {
        Ok(frame) => Some(frame),
        Err(e) => {
            debug!(event = "control_frame_dropped", %e, "Dropping unparseable control frame");
            None
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_frame_round_trips_with_expected_shape() {
        let frame = ControlFrame::Meta {
            id: Uuid::new_v4(),
            name: "photo.jpg".into(),
            size: 51200,
            mime: "image/jpeg".into(),
        };
        let text = encode_control(&frame).unwrap();
        assert!(text.contains(r#""type":"meta""#));
        assert!(text.contains(r#""size":51200"#));
        assert_eq!(decode_control(&text).unwrap(), frame);
    }

    #[test]
    fn end_frame_round_trips() {
        let frame = ControlFrame::End { id: Uuid::new_v4() };
        let text = encode_control(&frame).unwrap();
        assert!(text.contains(r#""type":"end""#));
        assert_eq!(decode_control(&text).unwrap(), frame);
    }

    #[test]
    fn unknown_type_is_dropped() {
        let id = Uuid::new_v4();
        let text = format!(r#"{{"type":"ping","id":"{id}"}}"#);
        assert_eq!(decode_control(&text), None);
    }

    #[test]
    fn malformed_json_is_dropped() {
        assert_eq!(decode_control("not json at all"), None);
        assert_eq!(decode_control(r#"{"type":"meta""#), None);
        assert_eq!(decode_control(r#"{"type":"meta","id":"not-a-uuid"}"#), None);
    }
}
