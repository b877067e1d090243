//! Error types for Warden.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A shared error type for every Warden crate.
///
/// Variants are structured so callers can react to the failure class
/// (launch failures vs. per-line stream noise vs. mailbox trouble) without
/// string matching.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum WardenError {
    /// No engine runtime could be resolved by any discovery strategy
    #[error("Engine runtime not found (tried: {})", attempted.join(", "))]
    RuntimeNotFound { attempted: Vec<String> },

    /// The engine subprocess could not be spawned
    #[error("Failed to launch engine for channel '{channel_id}': {message}")]
    ProcessLaunch { channel_id: String, message: String },

    /// The requested working directory is missing or not a directory
    #[error("Invalid working directory: {path}")]
    InvalidWorkingDirectory { path: String },

    /// A turn is already running on the channel
    #[error("Channel '{channel_id}' already has a running turn")]
    ChannelBusy { channel_id: String },

    /// A stdout line could not be decoded (logged and skipped by callers)
    #[error("Malformed stream line: {message}")]
    StreamParse { line: String, message: String },

    /// A permission request was not answered in time
    #[error("Permission request timed out for channel '{channel_id}'")]
    PermissionTimeout { channel_id: String },

    /// Permission mailbox transport error
    #[error("Mailbox error: {0}")]
    Mailbox(String),

    /// IO error (file system and pipe operations)
    #[error("IO error: {message}")]
    Io { message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {format} - {message}")]
    Serialization {
        format: String, // "TOML", "JSON", etc.
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WardenError {
    // ============================================================================
    // Constructor helpers
    // ============================================================================

    /// Creates a ProcessLaunch error
    pub fn process_launch(channel_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProcessLaunch {
            channel_id: channel_id.into(),
            message: message.into(),
        }
    }

    /// Creates an InvalidWorkingDirectory error
    pub fn invalid_working_directory(path: impl Into<String>) -> Self {
        Self::InvalidWorkingDirectory { path: path.into() }
    }

    /// Creates a ChannelBusy error
    pub fn channel_busy(channel_id: impl Into<String>) -> Self {
        Self::ChannelBusy {
            channel_id: channel_id.into(),
        }
    }

    /// Creates a StreamParse error, keeping a bounded excerpt of the line
    pub fn stream_parse(line: &str, message: impl Into<String>) -> Self {
        let excerpt: String = line.chars().take(200).collect();
        Self::StreamParse {
            line: excerpt,
            message: message.into(),
        }
    }

    /// Creates a PermissionTimeout error
    pub fn permission_timeout(channel_id: impl Into<String>) -> Self {
        Self::PermissionTimeout {
            channel_id: channel_id.into(),
        }
    }

    /// Creates a Mailbox error
    pub fn mailbox(message: impl Into<String>) -> Self {
        Self::Mailbox(message.into())
    }

    /// Creates an IO error
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates a Config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Creates an Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    // ============================================================================
    // Type checking methods
    // ============================================================================

    /// Check if this error prevented a turn from starting at all
    pub fn is_launch_failure(&self) -> bool {
        matches!(
            self,
            Self::RuntimeNotFound { .. }
                | Self::ProcessLaunch { .. }
                | Self::InvalidWorkingDirectory { .. }
                | Self::ChannelBusy { .. }
        )
    }

    /// Check if this is a StreamParse error
    pub fn is_stream_parse(&self) -> bool {
        matches!(self, Self::StreamParse { .. })
    }

    /// Check if this is a ChannelBusy error
    pub fn is_channel_busy(&self) -> bool {
        matches!(self, Self::ChannelBusy { .. })
    }

    /// Check if this is an IO error
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. })
    }

    /// Check if this is a serialization error
    pub fn is_serialization(&self) -> bool {
        matches!(self, Self::Serialization { .. })
    }

    /// Check if this is a config error
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

// ============================================================================
// From implementations for automatic conversion
// ============================================================================

impl From<std::io::Error> for WardenError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: format!("{} (kind: {:?})", err, err.kind()),
        }
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            format: "JSON".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for WardenError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization {
            format: "TOML".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<toml::ser::Error> for WardenError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization {
            format: "TOML".to_string(),
            message: err.to_string(),
        }
    }
}

/// Result type alias using WardenError
pub type Result<T> = std::result::Result<T, WardenError>;
