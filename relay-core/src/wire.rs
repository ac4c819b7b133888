//! Frames exchanged between the relay and its clients.
//!
//! Each frame is `data: <json>\n\n` where `<json>` is one of
//! `{"content": "..."}`, `{"done": true}` or `{"error": "..."}`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{CoreResult, RelayError};

/// Separates two frames on the wire.
pub const FRAME_SEPARATOR: &str = "\n\n";
/// Prefix of every data frame.
pub const DATA_PREFIX: &str = "data:";

/// Text shown when the upstream fails, before or during a stream.
pub const UPSTREAM_FAILURE_MESSAGE: &str = "Failed to get response from AI";
pub const MESSAGE_REQUIRED: &str = "Message is required";
pub const ROUTE_NOT_FOUND: &str = "Route not found";
pub const INVALID_BODY: &str = "Invalid request body";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Content { content: String },
    Done { done: bool },
    Error { error: String },
}

impl StreamEvent {
    pub fn content(delta: impl Into<String>) -> Self {
        Self::Content {
            content: delta.into(),
        }
    }

    pub fn done() -> Self {
        Self::Done { done: true }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }

    /// `done: true` and `error` close a stream; `done: false` does not.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done { done: true } | Self::Error { .. })
    }

    /// Serialize into one complete wire frame.
    pub fn to_frame(&self) -> Bytes {
        // serializing these shapes cannot fail: only strings and bools
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("{DATA_PREFIX} {json}{FRAME_SEPARATOR}").into()
    }
}

/// Body of every single-shot error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Parse one frame (separator already removed).
///
/// `Ok(None)` for frames without the data marker, which carry nothing for us
/// (comments, `event:` lines, keep-alives).
pub fn parse_frame(frame: &str) -> CoreResult<Option<StreamEvent>> {
    let Some(payload) = frame.trim_start_matches(['\r', '\n']).strip_prefix(DATA_PREFIX) else {
        return Ok(None);
    };
    let payload = payload.strip_prefix(' ').unwrap_or(payload);
    serde_json::from_str::<StreamEvent>(payload)
        .map(Some)
        .map_err(|e| RelayError::FrameParse(format!("{e}: {payload}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_match_wire_format() {
        assert_eq!(
            StreamEvent::content("Hi").to_frame().as_ref(),
            b"data: {\"content\":\"Hi\"}\n\n"
        );
        assert_eq!(StreamEvent::done().to_frame().as_ref(), b"data: {\"done\":true}\n\n");
        assert_eq!(
            StreamEvent::error("boom").to_frame().as_ref(),
            b"data: {\"error\":\"boom\"}\n\n"
        );
    }

    #[test]
    fn content_escapes_newlines_inside_json() {
        let frame = StreamEvent::content("a\n\nb").to_frame();
        let text = std::str::from_utf8(&frame).unwrap();
        // the only raw blank line is the terminating separator
        assert_eq!(text.matches(FRAME_SEPARATOR).count(), 1);
        assert!(text.ends_with(FRAME_SEPARATOR));
    }

    #[test]
    fn parse_each_variant() {
        assert_eq!(
            parse_frame(r#"data: {"content":" there!"}"#).unwrap(),
            Some(StreamEvent::content(" there!"))
        );
        assert_eq!(parse_frame(r#"data: {"done":true}"#).unwrap(), Some(StreamEvent::done()));
        assert_eq!(
            parse_frame(r#"data:{"error":"x"}"#).unwrap(),
            Some(StreamEvent::error("x"))
        );
    }

    #[test]
    fn done_false_is_not_terminal() {
        let ev = parse_frame(r#"data: {"done":false}"#).unwrap().unwrap();
        assert!(!ev.is_terminal());
        assert!(StreamEvent::done().is_terminal());
        assert!(StreamEvent::error("x").is_terminal());
        assert!(!StreamEvent::content("x").is_terminal());
    }

    #[test]
    fn frames_without_marker_are_ignored() {
        assert_eq!(parse_frame(": keep-alive").unwrap(), None);
        assert_eq!(parse_frame("event: ping").unwrap(), None);
        assert_eq!(parse_frame("").unwrap(), None);
    }

    #[test]
    fn malformed_payload_is_frame_parse_error() {
        let err = parse_frame("data: {\"content\":").unwrap_err();
        assert_eq!(err.kind(), "frame_parse");
        let err = parse_frame("data: [1,2]").unwrap_err();
        assert!(matches!(err, RelayError::FrameParse(_)));
    }

    #[test]
    fn error_body_shape() {
        let json = serde_json::to_string(&ErrorBody::new(MESSAGE_REQUIRED)).unwrap();
        assert_eq!(json, r#"{"error":"Message is required"}"#);
    }
}
