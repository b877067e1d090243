use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

/// Discriminant of a message in the conversation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MessageKind {
    User,
    Assistant,
    Error,
    System,
}

/// One entry of a session's ordered message log.
///
/// A message is immutable once finalized. The only exception is the
/// in-flight assistant message (`streaming == true`), which receives content
/// deltas until the turn-end marker arrives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    /// RFC 3339 timestamp.
    pub timestamp: String,
    /// Plain-text rendering of the message.
    pub content: String,
    /// The engine envelope this message was built from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub streaming: bool,
}

impl Message {
    fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: chrono::Utc::now().to_rfc3339(),
            content: content.into(),
            raw: None,
            streaming: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageKind::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Assistant, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Error, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageKind::System, content)
    }

    /// An empty assistant message that accepts content deltas.
    pub fn streaming_assistant() -> Self {
        Self {
            streaming: true,
            ..Self::new(MessageKind::Assistant, "")
        }
    }

    /// Builds a log entry from an engine message envelope.
    ///
    /// The kind is derived from the envelope's `type` field. Returns `None`
    /// for envelopes that carry no log-worthy content: session `init`
    /// notices, successful `result` summaries and unknown types.
    pub fn from_envelope(envelope: &Value) -> Option<Self> {
        let envelope_type = envelope.get("type").and_then(Value::as_str)?;
        let text = envelope_text(envelope);

        let kind = match envelope_type {
            "assistant" => MessageKind::Assistant,
            "user" => MessageKind::User,
            "system" => {
                if envelope.get("subtype").and_then(Value::as_str) == Some("init") {
                    return None;
                }
                MessageKind::System
            }
            "error" => MessageKind::Error,
            "result" => {
                let is_error = envelope
                    .get("is_error")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if !is_error {
                    return None;
                }
                MessageKind::Error
            }
            _ => return None,
        };

        Some(Self {
            raw: Some(envelope.clone()),
            ..Self::new(kind, text)
        })
    }

    /// Whether the message is a finalized assistant message with nothing in it.
    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty() && self.raw.is_none()
    }
}

/// Extracts the plain text of an engine envelope.
///
/// Looks at `message.content` (a string or an array of blocks, of which only
/// `text` blocks contribute), then at the top-level `result`, `error` and
/// `content` fields.
pub fn envelope_text(envelope: &Value) -> String {
    if let Some(content) = envelope.get("message").and_then(|m| m.get("content")) {
        match content {
            Value::String(s) => return s.clone(),
            Value::Array(blocks) => {
                let texts: Vec<&str> = blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                    .filter_map(|b| b.get("text").and_then(Value::as_str))
                    .collect();
                return texts.join("\n");
            }
            _ => {}
        }
    }

    ["result", "error", "content"]
        .iter()
        .filter_map(|key| envelope.get(*key))
        .find_map(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => map
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
        .unwrap_or_default()
}
