use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::permission::{DEFAULT_MEMORY_CAPACITY, PermissionMode};
use crate::session::DEFAULT_CONTEXT_LIMIT;

/// Environment variable naming the permission mailbox directory, read by
/// the host and passed on to every engine process.
pub const ENV_PERMISSION_DIR: &str = "WARDEN_PERMISSION_DIR";
/// Socket path handed to engines when the socket transport is active.
pub const ENV_PERMISSION_SOCKET: &str = "WARDEN_PERMISSION_SOCKET";
/// Channel id handed to every engine process.
pub const ENV_CHANNEL_ID: &str = "WARDEN_CHANNEL_ID";
/// Permission timeout in seconds. Overrides the config file on the host and
/// is exported to engines so the `ask` client waits as long as the broker.
pub const ENV_PERMISSION_TIMEOUT_SECS: &str = "WARDEN_PERMISSION_TIMEOUT_SECS";

/// Root of `config.toml`. Every section is optional.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct WardenConfig {
    pub runtime: RuntimeConfig,
    pub supervisor: SupervisorConfig,
    pub permission: PermissionConfig,
    pub session: SessionConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Explicit runtime executable; skips discovery when set.
    pub executable: Option<PathBuf>,
    /// Executable name looked up during discovery.
    pub executable_name: String,
    /// Bridge script passed as the runtime's first argument.
    pub bridge_script: PathBuf,
    pub verify_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            executable: None,
            executable_name: "node".to_string(),
            bridge_script: PathBuf::from("channel-manager.js"),
            verify_timeout_secs: 5,
        }
    }
}

impl RuntimeConfig {
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Time between SIGTERM and SIGKILL when interrupting a turn.
    pub interrupt_grace_ms: u64,
    /// How long to wait for the process to be reaped after SIGKILL.
    pub kill_wait_ms: u64,
    /// Give every engine a private temp directory.
    pub isolate_temp_dir: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interrupt_grace_ms: 3_000,
            kill_wait_ms: 2_000,
            isolate_temp_dir: true,
        }
    }
}

impl SupervisorConfig {
    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }
}

/// Permission mailbox transport.
#[derive(
    Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MailboxKind {
    #[default]
    Filesystem,
    Socket,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PermissionConfig {
    pub mailbox: MailboxKind,
    /// Mailbox directory; defaults to `<os temp>/warden-permission`.
    pub mailbox_dir: Option<PathBuf>,
    pub timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub memory_capacity: usize,
    pub memory_ttl_secs: u64,
    /// Never remember decisions about high-risk tools. Off by default.
    pub always_ask_high_risk: bool,
    pub default_mode: PermissionMode,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            mailbox: MailboxKind::Filesystem,
            mailbox_dir: None,
            timeout_secs: 60,
            poll_interval_ms: 100,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            memory_ttl_secs: 60 * 60,
            always_ask_high_risk: false,
            default_mode: PermissionMode::Default,
        }
    }
}

impl PermissionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn memory_ttl(&self) -> Duration {
        Duration::from_secs(self.memory_ttl_secs)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub context_limit: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            context_limit: DEFAULT_CONTEXT_LIMIT,
        }
    }
}
