//! Line decoder for engine stdout.
//!
//! Accepts the legacy tagged lines (`[CONTENT_DELTA] text`) and the
//! versioned framed records (`{"v":1,"kind":...}`) on the same stream. A
//! single space after a tag separates it from the payload; everything after
//! that space is payload, trailing whitespace included, so deltas such as
//! `"lo "` keep their spacing.

use serde_json::Value;
use warden_core::protocol::{Frame, StreamEvent, StreamEventKind};
use warden_core::{Result, WardenError};

/// One decoded stdout line.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedLine {
    Event(StreamEvent),
    /// An untagged line: engine noise kept only for diagnostics.
    Diagnostic(String),
}

/// Stateful only in the text accumulated for the in-flight assistant message.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    buffer: String,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text accumulated since the last start/end marker.
    pub fn buffered(&self) -> &str {
        &self.buffer
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Decodes one line (without its trailing newline).
    ///
    /// Returns `Ok(None)` for blank lines.
    ///
    /// # Errors
    ///
    /// Returns `WardenError::StreamParse` for a tagged or framed line whose
    /// payload is malformed. The decoder state is unchanged in that case and
    /// decoding can continue with the next line.
    pub fn decode_line(&mut self, line: &str) -> Result<Option<DecodedLine>> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.trim().is_empty() {
            return Ok(None);
        }

        if let Some(event) = decode_framed(line)? {
            return Ok(Some(DecodedLine::Event(self.accumulate(event))));
        }

        match decode_tagged(line)? {
            Some(event) => Ok(Some(DecodedLine::Event(self.accumulate(event)))),
            None => Ok(Some(DecodedLine::Diagnostic(line.to_string()))),
        }
    }

    fn accumulate(&mut self, event: StreamEvent) -> StreamEvent {
        match event {
            StreamEvent::Content(ref text) | StreamEvent::ContentDelta(ref text) => {
                self.buffer.push_str(text);
                event
            }
            StreamEvent::MessageStart => {
                self.buffer.clear();
                event
            }
            StreamEvent::MessageEnd { .. } => StreamEvent::MessageEnd {
                text: std::mem::take(&mut self.buffer),
            },
            other => other,
        }
    }
}

/// Returns `Ok(None)` when the line is not a framed record at all.
fn decode_framed(line: &str) -> Result<Option<StreamEvent>> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('{') {
        return Ok(None);
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) if map.contains_key("v") => {
            let frame: Frame = serde_json::from_value(Value::Object(map))
                .map_err(|e| WardenError::stream_parse(line, format!("invalid frame: {e}")))?;
            frame.into_event(line).map(Some)
        }
        Ok(_) => Ok(None),
        Err(e) if trimmed.starts_with("{\"v\"") => Err(WardenError::stream_parse(
            line,
            format!("invalid frame: {e}"),
        )),
        Err(_) => Ok(None),
    }
}

/// Returns `Ok(None)` when the line carries no known tag.
fn decode_tagged(line: &str) -> Result<Option<StreamEvent>> {
    for kind in StreamEventKind::by_tag_precedence() {
        let Some(rest) = line.strip_prefix(kind.tag()) else {
            continue;
        };
        let payload = rest.strip_prefix(' ').unwrap_or(rest);

        let event = match kind {
            StreamEventKind::Message => {
                let value: Value = serde_json::from_str(payload).map_err(|e| {
                    WardenError::stream_parse(line, format!("invalid message envelope: {e}"))
                })?;
                if !value.is_object() {
                    return Err(WardenError::stream_parse(
                        line,
                        "message envelope must be a JSON object",
                    ));
                }
                StreamEvent::Message(value)
            }
            StreamEventKind::Content => StreamEvent::Content(payload.to_string()),
            StreamEventKind::ContentDelta => StreamEvent::ContentDelta(payload.to_string()),
            StreamEventKind::SessionId => {
                let id = payload.trim();
                if id.is_empty() {
                    return Err(WardenError::stream_parse(line, "empty session id"));
                }
                StreamEvent::SessionId(id.to_string())
            }
            StreamEventKind::MessageStart => StreamEvent::MessageStart,
            StreamEventKind::MessageEnd => StreamEvent::MessageEnd {
                text: String::new(),
            },
        };
        return Ok(Some(event));
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn events(decoder: &mut StreamDecoder, lines: &[&str]) -> Vec<StreamEvent> {
        lines
            .iter()
            .filter_map(|line| match decoder.decode_line(line).unwrap() {
                Some(DecodedLine::Event(event)) => Some(event),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_deltas_flush_on_message_end() {
        let mut decoder = StreamDecoder::new();
        let out = events(
            &mut decoder,
            &[
                "[MESSAGE_START]",
                "[CONTENT_DELTA] Hel",
                "[CONTENT_DELTA] lo ",
                "[CONTENT_DELTA] world",
                "[MESSAGE_END]",
            ],
        );

        assert_eq!(out.len(), 5);
        assert_eq!(
            out.last(),
            Some(&StreamEvent::MessageEnd {
                text: "Hello world".into()
            })
        );
        assert_eq!(decoder.buffered(), "");
    }

    #[test]
    fn test_decoder_is_reentrant_across_turns() {
        let mut decoder = StreamDecoder::new();
        events(&mut decoder, &["[MESSAGE_START]", "[CONTENT_DELTA] first", "[MESSAGE_END]"]);
        let out = events(
            &mut decoder,
            &["[MESSAGE_START]", "[CONTENT] second", "[MESSAGE_END]"],
        );
        assert_eq!(
            out.last(),
            Some(&StreamEvent::MessageEnd {
                text: "second".into()
            })
        );
    }

    #[test]
    fn test_untagged_lines_are_diagnostics() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(
            decoder.decode_line("Loading SDK...").unwrap(),
            Some(DecodedLine::Diagnostic("Loading SDK...".into()))
        );
        assert_eq!(
            decoder.decode_line(r#"{"level":"debug"}"#).unwrap(),
            Some(DecodedLine::Diagnostic(r#"{"level":"debug"}"#.into()))
        );
        assert_eq!(decoder.decode_line("   ").unwrap(), None);
    }

    #[test]
    fn test_message_and_session_id() {
        let mut decoder = StreamDecoder::new();
        let out = events(
            &mut decoder,
            &[
                r#"[MESSAGE] {"type":"assistant","message":{"content":"hi"}}"#,
                "[SESSION_ID] 3f2a-11\r",
            ],
        );
        assert_eq!(
            out,
            vec![
                StreamEvent::Message(json!({"type": "assistant", "message": {"content": "hi"}})),
                StreamEvent::SessionId("3f2a-11".into()),
            ]
        );
    }

    #[test]
    fn test_malformed_lines_error_without_losing_state() {
        let mut decoder = StreamDecoder::new();
        events(&mut decoder, &["[MESSAGE_START]", "[CONTENT_DELTA] kept"]);

        assert!(decoder.decode_line("[MESSAGE] {broken").unwrap_err().is_stream_parse());
        assert!(decoder.decode_line("[MESSAGE] [1,2]").unwrap_err().is_stream_parse());
        assert!(decoder.decode_line("[SESSION_ID]").unwrap_err().is_stream_parse());
        assert!(decoder
            .decode_line(r#"{"v":9,"kind":"content","data":"x"}"#)
            .unwrap_err()
            .is_stream_parse());
        assert!(decoder.decode_line(r#"{"v":1,"kind""#).unwrap_err().is_stream_parse());

        assert_eq!(decoder.buffered(), "kept");
    }

    #[test]
    fn test_framed_and_tagged_mix() {
        let mut decoder = StreamDecoder::new();
        let out = events(
            &mut decoder,
            &[
                r#"{"v":1,"kind":"message_start"}"#,
                r#"{"v":1,"kind":"content_delta","data":"line one\n"}"#,
                "[CONTENT_DELTA] line two",
                r#"{"v":1,"kind":"message_end"}"#,
            ],
        );
        assert_eq!(
            out.last(),
            Some(&StreamEvent::MessageEnd {
                text: "line one\nline two".into()
            })
        );
    }
}
