use std::path::PathBuf;
use std::sync::Arc;

use warden_core::TurnOutcome;
use warden_core::permission::PermissionMode;
use warden_core::protocol::StreamEvent;
use warden_core::session::{
    ContextUsage, DEFAULT_CONTEXT_LIMIT, Message, MessageKind, Session, SessionStatus,
    context_usage,
};

/// Presentation-layer hooks.
///
/// Callbacks run synchronously while the state machine is being updated,
/// so implementations should hand the data off rather than block.
pub trait SessionObserver: Send + Sync {
    /// The message list changed; `messages` is the full list.
    fn on_messages_changed(&self, _messages: &[Message]) {}

    /// Busy, loading or error flags changed.
    fn on_state_changed(&self, _status: &SessionStatus) {}

    /// The engine announced the session id.
    fn on_session_id(&self, _session_id: &str) {}
}

/// Folds decoded engine events into a session's message log.
///
/// Owns the only mutable copy of the [`Session`]. Live streaming appends
/// incrementally; [`load_history`](Self::load_history) discards and
/// replaces the whole log.
pub struct SessionStateMachine {
    session: Session,
    context_limit: u64,
    /// Index of the in-flight assistant message receiving deltas.
    streaming: Option<usize>,
    observers: Vec<Arc<dyn SessionObserver>>,
}

impl SessionStateMachine {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            context_limit: DEFAULT_CONTEXT_LIMIT,
            streaming: None,
            observers: Vec::new(),
        }
    }

    pub fn with_context_limit(mut self, context_limit: u64) -> Self {
        self.context_limit = context_limit;
        self
    }

    pub fn add_observer(&mut self, observer: Arc<dyn SessionObserver>) {
        self.observers.push(observer);
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn messages(&self) -> &[Message] {
        &self.session.messages
    }

    pub fn status(&self) -> &SessionStatus {
        &self.session.status
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.id.as_deref()
    }

    pub fn is_busy(&self) -> bool {
        self.session.status.busy
    }

    pub fn context_usage(&self) -> ContextUsage {
        context_usage(&self.session.messages, self.context_limit)
    }

    pub fn set_permission_mode(&mut self, mode: PermissionMode) {
        self.session.permission_mode = mode;
    }

    pub fn set_cwd(&mut self, cwd: PathBuf) {
        self.session.cwd = cwd;
    }

    /// Records the user's prompt and marks the session busy.
    pub fn begin_turn(&mut self, prompt: &str) {
        self.session.messages.push(Message::user(prompt));
        self.streaming = None;
        self.session.status.busy = true;
        self.session.status.error = None;
        self.notify_messages();
        self.notify_state();
    }

    /// Applies one decoded event. Returns whether the session changed.
    pub fn apply(&mut self, event: &StreamEvent) -> bool {
        match event {
            StreamEvent::SessionId(id) => self.accept_session_id(id),
            StreamEvent::MessageStart => {
                self.open_streaming();
                self.notify_messages();
                true
            }
            StreamEvent::Content(text) | StreamEvent::ContentDelta(text) => {
                if text.is_empty() {
                    return false;
                }
                let index = self.open_streaming();
                self.session.messages[index].content.push_str(text);
                self.notify_messages();
                true
            }
            StreamEvent::MessageEnd { text } => {
                let Some(index) = self.streaming else {
                    return false;
                };
                let message = &mut self.session.messages[index];
                if message.content.is_empty() {
                    message.content = text.clone();
                }
                self.finalize_streaming();
                self.notify_messages();
                true
            }
            StreamEvent::Message(envelope) => {
                let Some(message) = Message::from_envelope(envelope) else {
                    return false;
                };
                self.append_envelope(message);
                self.notify_messages();
                true
            }
        }
    }

    /// Closes the turn. A failure is reported exactly once: as the error
    /// flag and as one error message in the log. An interrupt with a reason
    /// (a denied or timed-out permission) leaves one system message and no
    /// error flag.
    pub fn finish_turn(&mut self, outcome: &TurnOutcome) {
        self.finalize_streaming();
        self.session.status.busy = false;
        match outcome {
            TurnOutcome::Completed | TurnOutcome::Interrupted { reason: None } => {
                self.session.status.error = None;
            }
            TurnOutcome::Interrupted {
                reason: Some(reason),
            } => {
                self.session.messages.push(Message::system(reason.clone()));
                self.session.status.error = None;
            }
            TurnOutcome::Failed { reason, .. } => {
                self.session.messages.push(Message::error(reason.clone()));
                self.session.status.error = Some(reason.clone());
            }
        }
        self.notify_messages();
        self.notify_state();
    }

    /// Reports a failure that happened before any turn could start.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.finish_turn(&TurnOutcome::failed(reason, None));
    }

    /// Replaces the message log wholesale.
    pub fn load_history(&mut self, messages: Vec<Message>) {
        self.session.status.loading = true;
        self.notify_state();

        self.streaming = None;
        self.session.messages = messages;
        self.session.status.loading = false;
        self.notify_messages();
        self.notify_state();
    }

    fn accept_session_id(&mut self, id: &str) -> bool {
        if let Some(current) = &self.session.id {
            if current != id {
                tracing::debug!(
                    "[SessionState] Ignoring session id {} (already {})",
                    id,
                    current
                );
            }
            return false;
        }

        tracing::info!("[SessionState] Session id announced: {}", id);
        self.session.id = Some(id.to_string());
        for observer in &self.observers {
            observer.on_session_id(id);
        }
        true
    }

    fn open_streaming(&mut self) -> usize {
        if let Some(index) = self.streaming {
            return index;
        }
        self.session.messages.push(Message::streaming_assistant());
        let index = self.session.messages.len() - 1;
        self.streaming = Some(index);
        index
    }

    /// Finalizes the in-flight message, dropping it if nothing arrived.
    fn finalize_streaming(&mut self) {
        let Some(index) = self.streaming.take() else {
            return;
        };
        let message = &mut self.session.messages[index];
        message.streaming = false;
        if message.is_blank() {
            self.session.messages.remove(index);
        }
    }

    fn append_envelope(&mut self, message: Message) {
        // The full assistant envelope supersedes the deltas streamed for it.
        if message.kind == MessageKind::Assistant {
            if let Some(index) = self.streaming {
                let current = &mut self.session.messages[index];
                if !message.content.is_empty() {
                    current.content = message.content;
                }
                current.raw = message.raw;
                self.finalize_streaming();
                return;
            }
        }
        self.session.messages.push(message);
    }

    fn notify_messages(&self) {
        for observer in &self.observers {
            observer.on_messages_changed(&self.session.messages);
        }
    }

    fn notify_state(&self) {
        for observer in &self.observers {
            observer.on_state_changed(&self.session.status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        message_updates: Mutex<usize>,
        states: Mutex<Vec<SessionStatus>>,
        session_ids: Mutex<Vec<String>>,
    }

    impl SessionObserver for Recorder {
        fn on_messages_changed(&self, _messages: &[Message]) {
            *self.message_updates.lock().unwrap() += 1;
        }

        fn on_state_changed(&self, status: &SessionStatus) {
            self.states.lock().unwrap().push(status.clone());
        }

        fn on_session_id(&self, session_id: &str) {
            self.session_ids.lock().unwrap().push(session_id.to_string());
        }
    }

    fn machine() -> (SessionStateMachine, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let mut machine =
            SessionStateMachine::new(Session::new(PathBuf::from("/proj"), PermissionMode::Default));
        machine.add_observer(recorder.clone());
        (machine, recorder)
    }

    #[test]
    fn test_deltas_fold_into_one_assistant_message() {
        let (mut machine, _) = machine();
        machine.begin_turn("hi");

        machine.apply(&StreamEvent::MessageStart);
        for delta in ["Hel", "lo ", "world"] {
            machine.apply(&StreamEvent::ContentDelta(delta.to_string()));
        }
        assert!(machine.messages()[1].streaming);
        machine.apply(&StreamEvent::MessageEnd {
            text: "Hello world".to_string(),
        });
        machine.finish_turn(&TurnOutcome::Completed);

        let messages = machine.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind, MessageKind::User);
        assert_eq!(messages[1].kind, MessageKind::Assistant);
        assert_eq!(messages[1].content, "Hello world");
        assert!(!messages[1].streaming);
        assert!(!machine.is_busy());
    }

    #[test]
    fn test_assistant_envelope_finalizes_streamed_message() {
        let (mut machine, _) = machine();
        machine.begin_turn("hi");
        machine.apply(&StreamEvent::ContentDelta("partial".to_string()));

        let envelope = json!({
            "type": "assistant",
            "message": {"content": [{"type": "text", "text": "full answer"}]}
        });
        machine.apply(&StreamEvent::Message(envelope.clone()));
        machine.apply(&StreamEvent::MessageEnd {
            text: String::new(),
        });

        let messages = machine.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "full answer");
        assert_eq!(messages[1].raw, Some(envelope));
        assert!(!messages[1].streaming);
    }

    #[test]
    fn test_first_session_id_wins() {
        let (mut machine, recorder) = machine();

        assert!(machine.apply(&StreamEvent::SessionId("s-1".to_string())));
        assert!(!machine.apply(&StreamEvent::SessionId("s-2".to_string())));

        assert_eq!(machine.session_id(), Some("s-1"));
        assert_eq!(*recorder.session_ids.lock().unwrap(), vec!["s-1"]);
    }

    #[test]
    fn test_failure_reported_once() {
        let (mut machine, recorder) = machine();
        machine.begin_turn("hi");
        machine.apply(&StreamEvent::MessageStart);

        machine.finish_turn(&TurnOutcome::failed("Engine exited with 1", Some(1)));

        let errors: Vec<&Message> = machine
            .messages()
            .iter()
            .filter(|m| m.kind == MessageKind::Error)
            .collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].content, "Engine exited with 1");
        // The empty in-flight message was dropped.
        assert_eq!(machine.messages().len(), 2);

        let states = recorder.states.lock().unwrap();
        let last = states.last().unwrap();
        assert!(!last.busy);
        assert_eq!(last.error.as_deref(), Some("Engine exited with 1"));
        assert_eq!(states.iter().filter(|s| s.error.is_some()).count(), 1);
    }

    #[test]
    fn test_interrupted_turn_keeps_partial_text() {
        let (mut machine, _) = machine();
        machine.begin_turn("hi");
        machine.apply(&StreamEvent::ContentDelta("half an ans".to_string()));

        machine.finish_turn(&TurnOutcome::interrupted());

        assert_eq!(machine.messages().len(), 2);
        assert_eq!(machine.messages()[1].content, "half an ans");
        assert!(machine.status().error.is_none());
    }

    #[test]
    fn test_interrupt_reason_is_logged_once() {
        let (mut machine, recorder) = machine();
        machine.begin_turn("hi");
        machine.apply(&StreamEvent::MessageStart);

        machine.finish_turn(&TurnOutcome::interrupted_because(
            "Permission request timed out",
        ));

        let messages = machine.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].kind, MessageKind::System);
        assert_eq!(messages[1].content, "Permission request timed out");
        assert!(!machine.is_busy());
        let states = recorder.states.lock().unwrap();
        assert_eq!(states.iter().filter(|s| !s.busy).count(), 1);
    }

    #[test]
    fn test_load_history_replaces_log() {
        let (mut machine, recorder) = machine();
        machine.begin_turn("old");

        machine.load_history(vec![Message::user("a"), Message::assistant("b")]);

        assert_eq!(machine.messages().len(), 2);
        assert_eq!(machine.messages()[0].content, "a");
        let states = recorder.states.lock().unwrap();
        assert!(states.iter().any(|s| s.loading));
        assert!(!states.last().unwrap().loading);
    }

    #[test]
    fn test_init_and_successful_result_envelopes_are_skipped() {
        let (mut machine, recorder) = machine();
        let before = *recorder.message_updates.lock().unwrap();

        assert!(!machine.apply(&StreamEvent::Message(
            json!({"type": "system", "subtype": "init"})
        )));
        assert!(!machine.apply(&StreamEvent::Message(
            json!({"type": "result", "is_error": false, "result": "done"})
        )));
        assert!(machine.apply(&StreamEvent::Message(
            json!({"type": "result", "is_error": true, "result": "boom"})
        )));

        assert_eq!(machine.messages().len(), 1);
        assert_eq!(machine.messages()[0].kind, MessageKind::Error);
        assert_eq!(*recorder.message_updates.lock().unwrap(), before + 1);
    }

    #[test]
    fn test_context_usage_from_last_assistant_envelope() {
        let (mut machine, _) = machine();
        machine.apply(&StreamEvent::Message(json!({
            "type": "assistant",
            "message": {
                "content": [{"type": "text", "text": "ok"}],
                "usage": {"input_tokens": 1000, "cache_read_input_tokens": 9000}
            }
        })));

        let usage = machine.context_usage();
        assert_eq!(usage.used_tokens, 10_000);
        assert_eq!(usage.max_tokens, DEFAULT_CONTEXT_LIMIT);
        assert!((usage.percentage - 5.0).abs() < 1e-9);
    }
}
