//! Path management for Warden configuration and runtime directories.
//!
//! # Directory Structure
//!
//! ```text
//! ~/.config/warden/            # Config directory (dirs::config_dir)
//! └── config.toml              # WardenConfig
//!
//! <os temp>/warden-permission/ # Permission mailbox (WARDEN_PERMISSION_DIR)
//! ├── request-<channel>.json
//! ├── response-<channel>.json
//! └── warden.sock              # Socket transport
//!
//! <os temp>/warden-agent-tmp/  # Isolated engine temp directory
//! ```

use std::path::{Path, PathBuf};

pub use warden_core::config::ENV_PERMISSION_DIR;
use warden_core::config::WardenConfig;
use warden_core::{Result, WardenError};

pub const APP_DIR_NAME: &str = "warden";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const MAILBOX_DIR_NAME: &str = "warden-permission";
pub const ENGINE_TEMP_DIR_NAME: &str = "warden-agent-tmp";
pub const SOCKET_FILE_NAME: &str = "warden.sock";

pub struct WardenPaths;

impl WardenPaths {
    /// Returns the Warden configuration directory (e.g. `~/.config/warden/`).
    ///
    /// # Errors
    ///
    /// Returns `WardenError::Config` when the platform has no config directory.
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|dir| dir.join(APP_DIR_NAME))
            .ok_or_else(|| WardenError::config("Cannot find config directory"))
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join(CONFIG_FILE_NAME))
    }

    pub fn default_mailbox_dir() -> PathBuf {
        std::env::temp_dir().join(MAILBOX_DIR_NAME)
    }

    /// Resolves the mailbox directory: environment, then config, then default.
    pub fn mailbox_dir(config: &WardenConfig) -> PathBuf {
        std::env::var_os(ENV_PERMISSION_DIR)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
            .or_else(|| config.permission.mailbox_dir.clone())
            .unwrap_or_else(Self::default_mailbox_dir)
    }

    pub fn engine_temp_dir() -> PathBuf {
        std::env::temp_dir().join(ENGINE_TEMP_DIR_NAME)
    }

    pub fn socket_path(mailbox_dir: &Path) -> PathBuf {
        mailbox_dir.join(SOCKET_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths_nest_under_app_dir() {
        if let Ok(file) = WardenPaths::config_file() {
            assert!(file.ends_with("warden/config.toml"));
        }
    }

    #[test]
    fn test_socket_lives_in_mailbox_dir() {
        let dir = PathBuf::from("/tmp/warden-permission");
        assert_eq!(
            WardenPaths::socket_path(&dir),
            PathBuf::from("/tmp/warden-permission/warden.sock")
        );
    }
}
