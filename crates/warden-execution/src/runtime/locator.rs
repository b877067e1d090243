//! Engine runtime discovery.
//!
//! Strategies run in order and the first candidate that answers `--version`
//! wins:
//!
//! 1. an explicitly configured executable,
//! 2. the system locate command (`which` in a login shell, `where` on Windows),
//! 3. known install locations, version-manager directories newest first,
//! 4. every directory on `PATH`,
//! 5. the bare executable name, left to the OS to resolve.

use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use strum::Display;
use tokio::process::Command;
use warden_core::{Result, WardenError};

pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// The strategy that produced a [`RuntimeDiscovery`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DiscoveryMethod {
    Configured,
    LocateCommand,
    KnownPath,
    PathVariable,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeDiscovery {
    pub path: PathBuf,
    pub version: String,
    pub method: DiscoveryMethod,
    /// Every candidate considered, in order, including the winner.
    pub attempted: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RuntimeLocator {
    executable_name: String,
    configured: Option<PathBuf>,
    known_paths: Vec<PathBuf>,
    path_var: Option<OsString>,
    use_locate_command: bool,
    use_fallback: bool,
    verify_timeout: Duration,
}

impl RuntimeLocator {
    /// A locator with the platform defaults: known install locations for
    /// `executable_name`, the process `PATH`, the locate command and the
    /// bare-name fallback.
    pub fn new(executable_name: impl Into<String>) -> Self {
        let executable_name = executable_name.into();
        let known_paths = default_known_paths(&executable_name, dirs::home_dir().as_deref());
        Self {
            executable_name,
            configured: None,
            known_paths,
            path_var: std::env::var_os("PATH"),
            use_locate_command: true,
            use_fallback: true,
            verify_timeout: DEFAULT_VERIFY_TIMEOUT,
        }
    }

    pub fn with_configured(mut self, executable: Option<PathBuf>) -> Self {
        self.configured = executable;
        self
    }

    pub fn with_known_paths(mut self, known_paths: Vec<PathBuf>) -> Self {
        self.known_paths = known_paths;
        self
    }

    pub fn with_path_var(mut self, path_var: Option<OsString>) -> Self {
        self.path_var = path_var;
        self
    }

    pub fn with_locate_command(mut self, enabled: bool) -> Self {
        self.use_locate_command = enabled;
        self
    }

    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.use_fallback = enabled;
        self
    }

    pub fn with_verify_timeout(mut self, timeout: Duration) -> Self {
        self.verify_timeout = timeout;
        self
    }

    pub fn executable_name(&self) -> &str {
        &self.executable_name
    }

    /// Runs the discovery chain.
    ///
    /// # Errors
    ///
    /// Returns `WardenError::RuntimeNotFound` listing every candidate when no
    /// strategy produced a working executable.
    pub async fn discover(&self) -> Result<RuntimeDiscovery> {
        let mut attempted: Vec<String> = Vec::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        if let Some(configured) = &self.configured {
            attempted.push(configured.display().to_string());
            seen.insert(configured.clone());
            if let Some(version) = verify_runtime(configured, self.verify_timeout).await {
                return Ok(self.found(configured.clone(), version, DiscoveryMethod::Configured, attempted));
            }
            tracing::warn!(
                "[RuntimeLocator] Configured runtime {} did not verify, falling back to discovery",
                configured.display()
            );
        }

        if self.use_locate_command {
            if let Some(located) = self.locate_command().await {
                attempted.push(located.display().to_string());
                if seen.insert(located.clone()) {
                    if let Some(version) = verify_runtime(&located, self.verify_timeout).await {
                        return Ok(self.found(located, version, DiscoveryMethod::LocateCommand, attempted));
                    }
                }
            }
        }

        for candidate in &self.known_paths {
            attempted.push(candidate.display().to_string());
            if !candidate.is_file() || !seen.insert(candidate.clone()) {
                continue;
            }
            if let Some(version) = verify_runtime(candidate, self.verify_timeout).await {
                return Ok(self.found(candidate.clone(), version, DiscoveryMethod::KnownPath, attempted));
            }
        }

        if let Some(path_var) = &self.path_var {
            let file_name = executable_file_name(&self.executable_name);
            for dir in std::env::split_paths(path_var) {
                if dir.as_os_str().is_empty() {
                    continue;
                }
                let candidate = dir.join(&file_name);
                attempted.push(candidate.display().to_string());
                if !candidate.is_file() || !seen.insert(candidate.clone()) {
                    continue;
                }
                if let Some(version) = verify_runtime(&candidate, self.verify_timeout).await {
                    return Ok(self.found(candidate, version, DiscoveryMethod::PathVariable, attempted));
                }
            }
        }

        if self.use_fallback {
            let bare = PathBuf::from(&self.executable_name);
            attempted.push(self.executable_name.clone());
            if let Some(version) = verify_runtime(&bare, self.verify_timeout).await {
                return Ok(self.found(bare, version, DiscoveryMethod::Fallback, attempted));
            }
        }

        tracing::error!(
            "[RuntimeLocator] '{}' not found after {} candidates",
            self.executable_name,
            attempted.len()
        );
        Err(WardenError::RuntimeNotFound { attempted })
    }

    fn found(
        &self,
        path: PathBuf,
        version: String,
        method: DiscoveryMethod,
        attempted: Vec<String>,
    ) -> RuntimeDiscovery {
        tracing::info!(
            "[RuntimeLocator] Using {} ({}) via {}",
            path.display(),
            version,
            method
        );
        RuntimeDiscovery {
            path,
            version,
            method,
            attempted,
        }
    }

    /// Asks the system where the executable lives.
    async fn locate_command(&self) -> Option<PathBuf> {
        if !is_plain_command_name(&self.executable_name) {
            return None;
        }

        let mut command = if cfg!(windows) {
            let mut c = Command::new("where");
            c.arg(&self.executable_name);
            c
        } else {
            let shell = std::env::var("SHELL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "/bin/sh".to_string());
            let mut c = Command::new(shell);
            c.arg("-l")
                .arg("-c")
                .arg(format!("which {}", self.executable_name));
            c
        };
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.verify_timeout, command.output())
            .await
            .ok()?
            .ok()?;
        if !output.status.success() {
            return None;
        }

        // Login shells may print banners; take the last absolute path.
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| Path::new(line).is_absolute())
            .last()
            .map(PathBuf::from)
    }
}

/// Runs `<path> --version` and returns the first output line on success.
pub async fn verify_runtime(path: &Path, timeout: Duration) -> Option<String> {
    let mut command = Command::new(path);
    command
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            let version = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .unwrap_or("")
                .trim()
                .to_string();
            if version.is_empty() {
                tracing::debug!("[RuntimeLocator] {} printed no version", path.display());
                None
            } else {
                Some(version)
            }
        }
        Ok(Ok(output)) => {
            tracing::debug!(
                "[RuntimeLocator] {} --version exited with {}",
                path.display(),
                output.status
            );
            None
        }
        Ok(Err(e)) => {
            tracing::debug!("[RuntimeLocator] {} not runnable: {}", path.display(), e);
            None
        }
        Err(_) => {
            tracing::debug!(
                "[RuntimeLocator] {} --version timed out after {:?}",
                path.display(),
                timeout
            );
            None
        }
    }
}

fn is_plain_command_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn executable_file_name(name: &str) -> String {
    if cfg!(windows) && Path::new(name).extension().is_none() {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

/// Parses a version-manager directory name such as `v20.11.1`.
fn version_key(dir_name: &str) -> Vec<u64> {
    dir_name
        .trim_start_matches('v')
        .split('.')
        .map(|part| {
            part.chars()
                .take_while(char::is_ascii_digit)
                .collect::<String>()
                .parse()
                .unwrap_or(0)
        })
        .collect()
}

/// Lists `<root>/<version>/<suffix>` for every version directory, newest first.
fn versioned_candidates(root: &Path, suffix: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    let mut versions: Vec<(Vec<u64>, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            (version_key(&name), entry.path().join(suffix))
        })
        .collect();
    versions.sort_by(|a, b| b.0.cmp(&a.0));
    versions.into_iter().map(|(_, path)| path).collect()
}

/// Known per-OS install locations for `executable_name`.
pub fn default_known_paths(executable_name: &str, home: Option<&Path>) -> Vec<PathBuf> {
    let file_name = executable_file_name(executable_name);
    let mut paths = Vec::new();

    if cfg!(windows) {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            paths.extend(versioned_candidates(
                &PathBuf::from(appdata).join("nvm"),
                Path::new(&file_name),
            ));
        }
        for var in ["ProgramFiles", "ProgramFiles(x86)"] {
            if let Some(dir) = std::env::var_os(var) {
                paths.push(PathBuf::from(dir).join("nodejs").join(&file_name));
            }
        }
        if let Some(local) = std::env::var_os("LOCALAPPDATA") {
            paths.push(
                PathBuf::from(local)
                    .join("Programs")
                    .join("nodejs")
                    .join(&file_name),
            );
        }
        return paths;
    }

    if let Some(home) = home {
        paths.extend(versioned_candidates(
            &home.join(".nvm").join("versions").join("node"),
            &Path::new("bin").join(&file_name),
        ));
    }
    for dir in ["/usr/local/bin", "/opt/homebrew/bin", "/usr/bin"] {
        paths.push(Path::new(dir).join(&file_name));
    }
    if let Some(home) = home {
        paths.push(home.join(".volta").join("bin").join(&file_name));
        paths.push(
            home.join(".fnm")
                .join("aliases")
                .join("default")
                .join("bin")
                .join(&file_name),
        );
        paths.push(
            home.join(".local")
                .join("share")
                .join("fnm")
                .join("aliases")
                .join("default")
                .join("bin")
                .join(&file_name),
        );
    }
    paths
}
