//! Configuration service.
//!
//! Loads `WardenConfig` from `~/.config/warden/config.toml` and layers
//! environment overrides on top.

use std::path::{Path, PathBuf};

use warden_core::config::{MailboxKind, WardenConfig};
pub use warden_core::config::ENV_PERMISSION_TIMEOUT_SECS;
use warden_core::{Result, WardenError};

use crate::paths::{ENV_PERMISSION_DIR, WardenPaths};
use crate::storage::write_atomic_sync;

pub const ENV_RUNTIME: &str = "WARDEN_RUNTIME";
pub const ENV_BRIDGE_SCRIPT: &str = "WARDEN_BRIDGE_SCRIPT";
pub const ENV_MAILBOX: &str = "WARDEN_MAILBOX";

#[derive(Debug, Clone)]
pub struct ConfigService {
    path: PathBuf,
}

impl ConfigService {
    /// Uses the platform config file location.
    pub fn new() -> Result<Self> {
        Ok(Self {
            path: WardenPaths::config_file()?,
        })
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the config file. A missing or empty file yields the defaults.
    pub fn load_file(&self) -> Result<WardenConfig> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(
                    "[ConfigService] No config at {}, using defaults",
                    self.path.display()
                );
                return Ok(WardenConfig::default());
            }
            Err(e) => return Err(e.into()),
        };

        if content.trim().is_empty() {
            return Ok(WardenConfig::default());
        }
        Ok(toml::from_str(&content)?)
    }

    /// Reads the config file and applies process environment overrides.
    pub fn load(&self) -> Result<WardenConfig> {
        let mut config = self.load_file()?;
        apply_env_overrides(&mut config, |key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Writes the config atomically.
    pub fn save(&self, config: &WardenConfig) -> Result<()> {
        let content = toml::to_string_pretty(config)?;
        write_atomic_sync(&self.path, content.as_bytes())?;
        tracing::info!("[ConfigService] Saved config to {}", self.path.display());
        Ok(())
    }
}

/// Applies `WARDEN_*` overrides read through `lookup`.
///
/// Empty values are ignored.
///
/// # Errors
///
/// Returns `WardenError::Config` for values that do not parse.
pub fn apply_env_overrides<F>(config: &mut WardenConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(runtime) = get(ENV_RUNTIME) {
        config.runtime.executable = Some(PathBuf::from(runtime));
    }
    if let Some(script) = get(ENV_BRIDGE_SCRIPT) {
        config.runtime.bridge_script = PathBuf::from(script);
    }
    if let Some(dir) = get(ENV_PERMISSION_DIR) {
        config.permission.mailbox_dir = Some(PathBuf::from(dir));
    }
    if let Some(secs) = get(ENV_PERMISSION_TIMEOUT_SECS) {
        config.permission.timeout_secs = secs.trim().parse().map_err(|_| {
            WardenError::config(format!("{ENV_PERMISSION_TIMEOUT_SECS} must be an integer, got '{secs}'"))
        })?;
    }
    if let Some(kind) = get(ENV_MAILBOX) {
        config.permission.mailbox = kind.trim().parse::<MailboxKind>().map_err(|_| {
            WardenError::config(format!(
                "{ENV_MAILBOX} must be 'filesystem' or 'socket', got '{kind}'"
            ))
        })?;
    }
    Ok(())
}
