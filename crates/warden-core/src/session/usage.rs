//! Context-window usage derived from already-received message metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::{Message, MessageKind};

/// Context limit assumed when the host does not configure one.
pub const DEFAULT_CONTEXT_LIMIT: u64 = 200_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContextUsage {
    pub used_tokens: u64,
    pub max_tokens: u64,
    /// Share of the limit in use, capped at 100.
    pub percentage: f64,
}

impl ContextUsage {
    pub fn empty(max_tokens: u64) -> Self {
        Self {
            used_tokens: 0,
            max_tokens,
            percentage: 0.0,
        }
    }
}

/// Folds the message log into a context-usage figure.
///
/// Only the most recent assistant envelope carrying `message.usage` counts:
/// its input, cache-creation and cache-read tokens make up the prompt the
/// engine last sent.
pub fn context_usage(messages: &[Message], max_tokens: u64) -> ContextUsage {
    let usage = messages
        .iter()
        .rev()
        .filter(|m| m.kind == MessageKind::Assistant)
        .filter_map(|m| m.raw.as_ref())
        .find_map(|raw| raw.get("message").and_then(|msg| msg.get("usage")));

    let Some(usage) = usage else {
        return ContextUsage::empty(max_tokens);
    };

    let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);
    let used_tokens = field("input_tokens")
        + field("cache_creation_input_tokens")
        + field("cache_read_input_tokens");

    let percentage = if max_tokens == 0 {
        100.0
    } else {
        (used_tokens as f64 / max_tokens as f64 * 100.0).min(100.0)
    };

    ContextUsage {
        used_tokens,
        max_tokens,
        percentage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assistant_with_usage(input: u64, creation: u64, read: u64) -> Message {
        let envelope = json!({
            "type": "assistant",
            "message": {
                "content": [{"type": "text", "text": "ok"}],
                "usage": {
                    "input_tokens": input,
                    "cache_creation_input_tokens": creation,
                    "cache_read_input_tokens": read,
                    "output_tokens": 999
                }
            }
        });
        Message::from_envelope(&envelope).unwrap()
    }

    #[test]
    fn test_no_usage_is_empty() {
        let usage = context_usage(&[Message::user("hi")], DEFAULT_CONTEXT_LIMIT);
        assert_eq!(usage.used_tokens, 0);
        assert_eq!(usage.percentage, 0.0);
    }

    #[test]
    fn test_latest_assistant_usage_wins() {
        let messages = vec![
            assistant_with_usage(10, 0, 0),
            Message::user("again"),
            assistant_with_usage(1_000, 500, 500),
            Message::system("note"),
        ];
        let usage = context_usage(&messages, 200_000);
        assert_eq!(usage.used_tokens, 2_000);
        assert!((usage.percentage - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentage_capped() {
        let usage = context_usage(&[assistant_with_usage(300_000, 0, 0)], 200_000);
        assert_eq!(usage.percentage, 100.0);
    }
}
