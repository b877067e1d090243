use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::message::Message;
use crate::permission::PermissionMode;

/// Busy/loading/error flags observed by the presentation layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// A turn is running.
    pub busy: bool,
    /// History is being (re)loaded.
    pub loading: bool,
    /// The last failure, cleared when the next turn starts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One conversation with the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Engine-assigned id, absent until the engine announces it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub cwd: PathBuf,
    #[serde(default)]
    pub permission_mode: PermissionMode,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub status: SessionStatus,
    pub created_at: String,
}

impl Session {
    pub fn new(cwd: PathBuf, permission_mode: PermissionMode) -> Self {
        Self {
            id: None,
            cwd,
            permission_mode,
            messages: Vec::new(),
            status: SessionStatus::default(),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Returns the last message that is neither streaming nor blank, if any.
    pub fn last_finalized(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| !m.streaming && !m.is_blank())
    }
}
