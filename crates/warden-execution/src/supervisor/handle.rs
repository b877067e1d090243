use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use warden_core::TurnOutcome;
use warden_core::permission::PermissionMode;
use warden_core::protocol::StreamEvent;

/// A validated channel, ready to run turns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLaunch {
    pub channel_id: String,
    pub cwd: PathBuf,
    pub session_id: Option<String>,
}

/// Arguments of one turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub message: String,
    pub permission_mode: PermissionMode,
}

impl TurnRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            permission_mode: PermissionMode::Default,
        }
    }

    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }
}

/// What a running turn reports to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Stream(StreamEvent),
    /// Untagged engine output (stdout noise or stderr).
    Diagnostic(String),
    /// Always the last event of a turn, sent exactly once.
    Finished(TurnOutcome),
}

/// Registry entry for one live engine process.
#[derive(Debug, Clone)]
pub struct ChannelProcessHandle {
    pub channel_id: String,
    pub pid: Option<u32>,
    /// Distinguishes successive spawns on the same channel.
    pub generation: u64,
    pub(crate) alive: Arc<AtomicBool>,
    /// Set once, by whoever ends the turn first: an interrupt, or the turn
    /// task when the process exited on its own.
    pub(crate) interrupt_requested: Arc<AtomicBool>,
    pub(crate) interrupt_reason: Arc<OnceLock<String>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) exited: watch::Receiver<bool>,
}

impl ChannelProcessHandle {
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Claims the right to interrupt this process.
    ///
    /// Only the first caller gets `true`.
    pub(crate) fn claim_interrupt(&self) -> bool {
        !self.interrupt_requested.swap(true, Ordering::SeqCst)
    }

    /// Waits until the turn task has observed the process exit.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_exited(&self, timeout: Duration) -> bool {
        let mut exited = self.exited.clone();
        matches!(
            tokio::time::timeout(timeout, exited.wait_for(|done| *done)).await,
            Ok(Ok(_))
        )
    }
}

/// Consumer side of a running turn.
#[derive(Debug)]
pub struct TurnHandle {
    pub channel_id: String,
    pub pid: Option<u32>,
    pub generation: u64,
    pub(crate) events: mpsc::UnboundedReceiver<TurnEvent>,
}

impl TurnHandle {
    /// Next event, or `None` once the turn task is gone.
    pub async fn next_event(&mut self) -> Option<TurnEvent> {
        self.events.recv().await
    }

    /// Drains the turn and returns its outcome.
    pub async fn wait(mut self) -> TurnOutcome {
        while let Some(event) = self.next_event().await {
            if let TurnEvent::Finished(outcome) = event {
                return outcome;
            }
        }
        TurnOutcome::failed("Engine turn ended without a terminal event", None)
    }
}
