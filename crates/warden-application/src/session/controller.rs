use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Mutex;
use warden_core::permission::PermissionMode;
use warden_core::session::{ContextUsage, Message, Session};
use warden_core::{InterruptOutcome, Result, TurnOutcome, WardenError};
use warden_execution::{ProcessSupervisor, TurnEvent, TurnRequest};

use super::state_machine::{SessionObserver, SessionStateMachine};

/// Drives one conversation: starts turns on the supervisor and folds their
/// events into the session state.
///
/// Every turn ends in exactly one terminal report to the state machine,
/// whatever the failure path.
pub struct SessionController {
    channel_id: String,
    supervisor: Arc<ProcessSupervisor>,
    state: Arc<Mutex<SessionStateMachine>>,
}

impl SessionController {
    pub fn new(
        channel_id: impl Into<String>,
        supervisor: Arc<ProcessSupervisor>,
        state: SessionStateMachine,
    ) -> Self {
        Self {
            channel_id: channel_id.into(),
            supervisor,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub async fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        self.state.lock().await.add_observer(observer);
    }

    /// A copy of the current session.
    pub async fn snapshot(&self) -> Session {
        self.state.lock().await.session().clone()
    }

    pub async fn context_usage(&self) -> ContextUsage {
        self.state.lock().await.context_usage()
    }

    /// Runs one turn to completion.
    ///
    /// Launch and spawn failures are not returned as errors: they end the
    /// turn as `Failed` and the session stays usable.
    ///
    /// # Errors
    ///
    /// Returns `WardenError::ChannelBusy` if a turn is already running; the
    /// session is left untouched in that case.
    pub async fn send(&self, prompt: &str) -> Result<TurnOutcome> {
        let (cwd, session_id, mode) = {
            let mut state = self.state.lock().await;
            if state.is_busy() {
                return Err(WardenError::channel_busy(&self.channel_id));
            }
            state.begin_turn(prompt);
            let session = state.session();
            (
                session.cwd.clone(),
                session.id.clone(),
                session.permission_mode,
            )
        };

        let cwd = cwd.to_string_lossy().into_owned();
        let requested_cwd = (!cwd.is_empty()).then_some(cwd.as_str());
        let launch = match self
            .supervisor
            .launch(&self.channel_id, requested_cwd, session_id)
            .await
        {
            Ok(launch) => launch,
            Err(e) => return Ok(self.report_failure(e).await),
        };
        if requested_cwd.is_none() {
            self.state.lock().await.set_cwd(launch.cwd.clone());
        }

        let turn = TurnRequest::new(prompt).with_permission_mode(mode);
        let mut handle = match self.supervisor.send(&launch, turn).await {
            Ok(handle) => handle,
            Err(e) => return Ok(self.report_failure(e).await),
        };

        while let Some(event) = handle.next_event().await {
            match event {
                TurnEvent::Stream(event) => {
                    self.state.lock().await.apply(&event);
                }
                TurnEvent::Diagnostic(line) => {
                    tracing::trace!("[SessionController] {}: {}", self.channel_id, line);
                }
                TurnEvent::Finished(outcome) => {
                    self.state.lock().await.finish_turn(&outcome);
                    return Ok(outcome);
                }
            }
        }

        let outcome = TurnOutcome::failed("Engine turn ended without a terminal event", None);
        self.state.lock().await.finish_turn(&outcome);
        Ok(outcome)
    }

    async fn report_failure(&self, error: WardenError) -> TurnOutcome {
        tracing::error!(
            "[SessionController] Turn on {} failed to start: {}",
            self.channel_id,
            error
        );
        let outcome = TurnOutcome::failed(error.to_string(), None);
        self.state.lock().await.finish_turn(&outcome);
        outcome
    }

    pub async fn interrupt(&self) -> InterruptOutcome {
        self.supervisor.interrupt(&self.channel_id).await
    }

    /// Replaces the message log with previously persisted history.
    ///
    /// # Errors
    ///
    /// Returns `WardenError::ChannelBusy` while a turn is running.
    pub async fn load_history(&self, messages: Vec<Message>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_busy() {
            return Err(WardenError::channel_busy(&self.channel_id));
        }
        state.load_history(messages);
        Ok(())
    }

    /// Applies to the next turn.
    pub async fn set_permission_mode(&self, mode: PermissionMode) {
        self.state.lock().await.set_permission_mode(mode);
    }

    /// Applies to the next turn.
    pub async fn set_cwd(&self, cwd: PathBuf) {
        self.state.lock().await.set_cwd(cwd);
    }
}
