//! Versioned framed records: one JSON object per stdout line.
//!
//! ```text
//! {"v":1,"kind":"content_delta","data":"Hel"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::{StreamEvent, StreamEventKind};
use crate::error::{Result, WardenError};

/// The only frame version understood by this build.
pub const FRAME_VERSION: u32 = 1;

/// A raw framed record before its payload is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub v: u32,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Frame {
    /// Builds the current-version frame for an event.
    pub fn from_event(event: &StreamEvent) -> Self {
        let data = match event {
            StreamEvent::Message(value) => value.clone(),
            StreamEvent::Content(text)
            | StreamEvent::ContentDelta(text)
            | StreamEvent::SessionId(text) => Value::String(text.clone()),
            StreamEvent::MessageStart | StreamEvent::MessageEnd { .. } => Value::Null,
        };
        Self {
            v: FRAME_VERSION,
            kind: event.kind().to_string(),
            data,
        }
    }

    /// Serializes the frame as a single stdout line (no trailing newline).
    pub fn encode(event: &StreamEvent) -> Result<String> {
        Ok(serde_json::to_string(&Self::from_event(event))?)
    }

    /// Interprets the frame's payload.
    ///
    /// `MessageEnd` is returned with empty text; the decoder fills in the
    /// accumulated buffer.
    ///
    /// # Errors
    ///
    /// Returns `WardenError::StreamParse` for unknown versions, unknown kinds
    /// or a payload of the wrong shape.
    pub fn into_event(self, line: &str) -> Result<StreamEvent> {
        if self.v != FRAME_VERSION {
            return Err(WardenError::stream_parse(
                line,
                format!("unsupported frame version {}", self.v),
            ));
        }

        let kind: StreamEventKind = self.kind.parse().map_err(|_| {
            WardenError::stream_parse(line, format!("unknown frame kind '{}'", self.kind))
        })?;

        let text = |data: Value| -> Result<String> {
            match data {
                Value::String(s) => Ok(s),
                other => Err(WardenError::stream_parse(
                    line,
                    format!("expected string payload for {kind}, got {other}"),
                )),
            }
        };

        Ok(match kind {
            StreamEventKind::Message => {
                if !self.data.is_object() {
                    return Err(WardenError::stream_parse(
                        line,
                        "message frame payload must be an object",
                    ));
                }
                StreamEvent::Message(self.data)
            }
            StreamEventKind::Content => StreamEvent::Content(text(self.data)?),
            StreamEventKind::ContentDelta => StreamEvent::ContentDelta(text(self.data)?),
            StreamEventKind::SessionId => StreamEvent::SessionId(text(self.data)?),
            StreamEventKind::MessageStart => StreamEvent::MessageStart,
            StreamEventKind::MessageEnd => StreamEvent::MessageEnd {
                text: String::new(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(line: &str) -> Result<StreamEvent> {
        let frame: Frame = serde_json::from_str(line)?;
        frame.into_event(line)
    }

    #[test]
    fn test_encode_shapes() {
        assert_eq!(
            Frame::encode(&StreamEvent::ContentDelta("Hel".into())).unwrap(),
            r#"{"v":1,"kind":"content_delta","data":"Hel"}"#
        );
        assert_eq!(
            Frame::encode(&StreamEvent::MessageStart).unwrap(),
            r#"{"v":1,"kind":"message_start"}"#
        );
    }

    #[test]
    fn test_multiline_content_survives_framing() {
        let event = StreamEvent::Content("line one\nline two".into());
        let line = Frame::encode(&event).unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(parse(&line).unwrap(), event);
    }

    #[test]
    fn test_message_payload_must_be_object() {
        let err = parse(r#"{"v":1,"kind":"message","data":"oops"}"#).unwrap_err();
        assert!(err.is_stream_parse());

        let ok = parse(r#"{"v":1,"kind":"message","data":{"type":"assistant"}}"#).unwrap();
        assert_eq!(ok, StreamEvent::Message(json!({"type": "assistant"})));
    }

    #[test]
    fn test_unknown_version_and_kind_rejected() {
        assert!(parse(r#"{"v":2,"kind":"content","data":"x"}"#)
            .unwrap_err()
            .is_stream_parse());
        assert!(parse(r#"{"v":1,"kind":"thinking","data":"x"}"#)
            .unwrap_err()
            .is_stream_parse());
    }
}
