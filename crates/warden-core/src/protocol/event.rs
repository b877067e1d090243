use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};

pub const TAG_MESSAGE: &str = "[MESSAGE]";
pub const TAG_CONTENT: &str = "[CONTENT]";
pub const TAG_CONTENT_DELTA: &str = "[CONTENT_DELTA]";
pub const TAG_SESSION_ID: &str = "[SESSION_ID]";
pub const TAG_MESSAGE_START: &str = "[MESSAGE_START]";
pub const TAG_MESSAGE_END: &str = "[MESSAGE_END]";

/// A structured event decoded from one engine stdout line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A full message envelope as emitted by the engine.
    Message(Value),
    /// A finalized content chunk.
    Content(String),
    /// A partial content delta for the in-flight assistant message.
    ContentDelta(String),
    /// The engine announced the conversation's session id.
    SessionId(String),
    /// An assistant message started streaming.
    MessageStart,
    /// The in-flight assistant message finished.
    ///
    /// `text` is the content accumulated by the decoder since the matching
    /// start marker. It is not part of the wire format.
    MessageEnd { text: String },
}

/// Wire-level discriminant of a [`StreamEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum StreamEventKind {
    Message,
    Content,
    ContentDelta,
    SessionId,
    MessageStart,
    MessageEnd,
}

impl StreamEventKind {
    /// The legacy line tag for this kind.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Message => TAG_MESSAGE,
            Self::Content => TAG_CONTENT,
            Self::ContentDelta => TAG_CONTENT_DELTA,
            Self::SessionId => TAG_SESSION_ID,
            Self::MessageStart => TAG_MESSAGE_START,
            Self::MessageEnd => TAG_MESSAGE_END,
        }
    }

    /// Tags ordered so that no tag is shadowed by a shorter prefix.
    pub fn by_tag_precedence() -> [Self; 6] {
        [
            Self::ContentDelta,
            Self::Content,
            Self::MessageStart,
            Self::MessageEnd,
            Self::Message,
            Self::SessionId,
        ]
    }
}

impl StreamEvent {
    pub fn kind(&self) -> StreamEventKind {
        match self {
            Self::Message(_) => StreamEventKind::Message,
            Self::Content(_) => StreamEventKind::Content,
            Self::ContentDelta(_) => StreamEventKind::ContentDelta,
            Self::SessionId(_) => StreamEventKind::SessionId,
            Self::MessageStart => StreamEventKind::MessageStart,
            Self::MessageEnd { .. } => StreamEventKind::MessageEnd,
        }
    }

    /// Renders the event in the legacy tagged-line format.
    ///
    /// Returns `None` for text payloads containing a newline, which the
    /// line protocol cannot carry; use a framed record instead.
    pub fn to_tagged_line(&self) -> Option<String> {
        let tag = self.kind().tag();
        let line = match self {
            Self::Message(value) => format!("{tag} {value}"),
            Self::Content(text) | Self::ContentDelta(text) | Self::SessionId(text) => {
                if text.contains('\n') {
                    return None;
                }
                format!("{tag} {text}")
            }
            Self::MessageStart | Self::MessageEnd { .. } => tag.to_string(),
        };
        Some(line)
    }
}
