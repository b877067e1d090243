//! Turn lifecycle types shared between the supervisor and its consumers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The terminal state of a single engine turn.
///
/// Every turn produces exactly one outcome, whichever exit path it takes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// The engine exited successfully.
    Completed,
    /// The engine exited with a failure (or could not be awaited).
    Failed {
        reason: String,
        exit_code: Option<i32>,
    },
    /// The turn was interrupted by the host or by a permission denial.
    ///
    /// `reason` is set when the interrupt came with an explanation, such as
    /// the deny reason of a permission request.
    Interrupted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl TurnOutcome {
    pub fn failed(reason: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::Failed {
            reason: reason.into(),
            exit_code,
        }
    }

    /// Interrupted with no further explanation.
    pub fn interrupted() -> Self {
        Self::Interrupted { reason: None }
    }

    pub fn interrupted_because(reason: impl Into<String>) -> Self {
        Self::Interrupted {
            reason: Some(reason.into()),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

/// Result of asking the supervisor to interrupt a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptOutcome {
    /// A live process was found and terminated.
    Interrupted,
    /// Nothing was running (or an interrupt was already in progress).
    NotRunning,
}

/// Anything able to stop the turn running on a channel.
///
/// The permission broker depends on this seam rather than on the process
/// supervisor directly.
#[async_trait]
pub trait TurnInterrupter: Send + Sync {
    /// Interrupts the turn running on `channel_id`.
    ///
    /// Must be idempotent: a second call for the same turn returns
    /// [`InterruptOutcome::NotRunning`].
    async fn interrupt(&self, channel_id: &str) -> InterruptOutcome;

    /// Like [`interrupt`](Self::interrupt), attaching `reason` to the
    /// interrupted turn's outcome when the implementation supports it.
    async fn interrupt_with_reason(&self, channel_id: &str, reason: &str) -> InterruptOutcome {
        let _ = reason;
        self.interrupt(channel_id).await
    }
}
