//! Tracing layer that forwards engine stdout/stderr diagnostics to a channel.
//!
//! The supervisor logs every untagged engine line under
//! [`ENGINE_LOG_TARGET`](crate::supervisor::ENGINE_LOG_TARGET). Hosts that
//! want to surface those lines (a debug panel, a log file per channel)
//! install this layer next to their formatting layer.

use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;

use crate::supervisor::ENGINE_LOG_TARGET;

/// One line of engine output.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineDiagnostic {
    pub channel_id: String,
    /// `stdout` or `stderr`
    pub stream: String,
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

pub struct EngineDiagnosticsLayer {
    sender: mpsc::UnboundedSender<EngineDiagnostic>,
}

impl EngineDiagnosticsLayer {
    pub fn new(sender: mpsc::UnboundedSender<EngineDiagnostic>) -> Self {
        Self { sender }
    }
}

fn field_str(fields: &HashMap<String, Value>, name: &str) -> String {
    fields
        .get(name)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

impl<S> Layer<S> for EngineDiagnosticsLayer
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().target() != ENGINE_LOG_TARGET {
            return;
        }

        let mut fields = HashMap::new();
        event.record(&mut FieldVisitor(&mut fields));

        let diagnostic = EngineDiagnostic {
            channel_id: field_str(&fields, "channel_id"),
            stream: field_str(&fields, "stream"),
            level: event.metadata().level().to_string(),
            message: field_str(&fields, "message"),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        // Receiver gone means nobody is listening.
        let _ = self.sender.send(diagnostic);
    }
}

/// Collects event fields as JSON values.
struct FieldVisitor<'a>(&'a mut HashMap<String, Value>);

impl tracing::field::Visit for FieldVisitor<'_> {
    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.0
            .insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0
            .insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.0
            .insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0
            .insert(field.name().to_string(), serde_json::json!(value));
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.insert(
            field.name().to_string(),
            serde_json::json!(format!("{:?}", value)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_forwards_only_engine_target() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscriber = tracing_subscriber::registry().with(EngineDiagnosticsLayer::new(tx));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("[Supervisor] unrelated");
            tracing::debug!(
                target: ENGINE_LOG_TARGET,
                channel_id = %"ch-1",
                stream = "stderr",
                "{}",
                "npm WARN something"
            );
        });

        let diagnostic = rx.try_recv().unwrap();
        assert_eq!(diagnostic.channel_id, "ch-1");
        assert_eq!(diagnostic.stream, "stderr");
        assert_eq!(diagnostic.level, "DEBUG");
        assert_eq!(diagnostic.message, "npm WARN something");
        assert!(rx.try_recv().is_err());
    }
}
