//! Per-channel engine process supervision.
//!
//! Every turn runs in its own engine process. The supervisor owns the
//! registry of live processes, turns their stdout into [`TurnEvent`]s and
//! guarantees that each turn ends with exactly one [`TurnOutcome`] and no
//! process left behind.

pub mod environment;
pub mod handle;
pub mod process;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warden_core::config::{
    ENV_CHANNEL_ID, ENV_PERMISSION_DIR, ENV_PERMISSION_TIMEOUT_SECS, WardenConfig,
};
use warden_core::{InterruptOutcome, Result, TurnInterrupter, TurnOutcome, WardenError};

use crate::runtime::{RuntimeDiscovery, RuntimeLocator};
use crate::stream::{DecodedLine, StreamDecoder};
use crate::workdir::{ENV_PROJECT_PATH, WorkingDirectoryResolver};
use environment::{TempMarkers, augmented_path};
pub use handle::{ChannelLaunch, ChannelProcessHandle, TurnEvent, TurnHandle, TurnRequest};

/// Tracing target for engine output; see `EngineDiagnosticsLayer`.
pub const ENGINE_LOG_TARGET: &str = "warden::engine";

/// How long to keep reading engine output after the process exited.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

type Registry = Arc<RwLock<HashMap<String, ChannelProcessHandle>>>;

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Script handed to the runtime as its first argument.
    pub bridge_script: PathBuf,
    pub interrupt_grace: Duration,
    pub kill_wait: Duration,
    /// Exported to engines as `WARDEN_PERMISSION_DIR`.
    pub mailbox_dir: Option<PathBuf>,
    /// Parent of the per-channel temp directories; `None` inherits the host's.
    pub engine_temp_root: Option<PathBuf>,
    pub extra_env: Vec<(String, String)>,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            bridge_script: PathBuf::from("channel-manager.js"),
            interrupt_grace: Duration::from_secs(3),
            kill_wait: Duration::from_secs(2),
            mailbox_dir: None,
            engine_temp_root: None,
            extra_env: Vec::new(),
        }
    }
}

impl SupervisorOptions {
    /// Engines inherit the host's permission timeout so the `ask` client
    /// never gives up before the broker does.
    pub fn from_config(config: &WardenConfig) -> Self {
        Self {
            bridge_script: config.runtime.bridge_script.clone(),
            interrupt_grace: config.supervisor.interrupt_grace(),
            kill_wait: config.supervisor.kill_wait(),
            ..Self::default()
        }
        .with_env(
            ENV_PERMISSION_TIMEOUT_SECS,
            config.permission.timeout_secs.to_string(),
        )
    }

    pub fn with_mailbox_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.mailbox_dir = dir;
        self
    }

    pub fn with_engine_temp_root(mut self, dir: Option<PathBuf>) -> Self {
        self.engine_temp_root = dir;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.push((key.into(), value.into()));
        self
    }

    /// Upper bound on how long an interrupt takes to observe the exit.
    fn exit_budget(&self) -> Duration {
        self.interrupt_grace + self.kill_wait + 2 * OUTPUT_DRAIN_TIMEOUT + Duration::from_secs(1)
    }

    fn absolute_bridge_script(&self) -> PathBuf {
        if self.bridge_script.is_absolute() {
            return self.bridge_script.clone();
        }
        std::env::current_dir()
            .map(|dir| dir.join(&self.bridge_script))
            .unwrap_or_else(|_| self.bridge_script.clone())
    }
}

pub struct ProcessSupervisor {
    locator: RuntimeLocator,
    resolver: WorkingDirectoryResolver,
    options: SupervisorOptions,
    runtime: RwLock<Option<RuntimeDiscovery>>,
    registry: Registry,
    next_generation: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(
        locator: RuntimeLocator,
        resolver: WorkingDirectoryResolver,
        options: SupervisorOptions,
    ) -> Self {
        Self {
            locator,
            resolver,
            options,
            runtime: RwLock::new(None),
            registry: Arc::new(RwLock::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    /// The resolved runtime, discovering it on first use.
    pub async fn runtime(&self) -> Result<RuntimeDiscovery> {
        if let Some(runtime) = self.runtime.read().await.as_ref() {
            return Ok(runtime.clone());
        }

        let mut cached = self.runtime.write().await;
        if let Some(runtime) = cached.as_ref() {
            return Ok(runtime.clone());
        }
        let runtime = self.locator.discover().await?;
        *cached = Some(runtime.clone());
        Ok(runtime)
    }

    /// Validates a channel's working directory and runtime.
    ///
    /// Nothing is spawned; the engine creates the conversation on the first
    /// [`send`](Self::send).
    ///
    /// # Errors
    ///
    /// - `InvalidWorkingDirectory` if no usable directory resolves
    /// - `RuntimeNotFound` if the runtime cannot be discovered
    pub async fn launch(
        &self,
        channel_id: &str,
        cwd: Option<&str>,
        session_id: Option<String>,
    ) -> Result<ChannelLaunch> {
        let cwd = self.resolver.resolve(cwd)?;
        self.runtime().await?;

        tracing::debug!(
            "[Supervisor] Channel {} ready in {}",
            channel_id,
            cwd.display()
        );
        Ok(ChannelLaunch {
            channel_id: channel_id.to_string(),
            cwd,
            session_id: session_id.filter(|id| !id.is_empty()),
        })
    }

    /// Starts a turn on a launched channel.
    ///
    /// # Errors
    ///
    /// - `ChannelBusy` if a turn is already running on the channel
    /// - `ProcessLaunch` if the engine could not be spawned
    /// - `RuntimeNotFound` if the runtime cannot be discovered
    pub async fn send(&self, launch: &ChannelLaunch, turn: TurnRequest) -> Result<TurnHandle> {
        let runtime = self.runtime().await?;
        let channel_id = launch.channel_id.clone();

        let mut registry = self.registry.write().await;
        if registry.get(&channel_id).is_some_and(|h| h.is_alive()) {
            return Err(WardenError::channel_busy(&channel_id));
        }

        let temp_dir = self.prepare_temp_dir(&channel_id).await;
        let markers = temp_dir.as_deref().map(TempMarkers::snapshot);

        let mut command = self.build_command(&runtime, launch, &turn, temp_dir.as_ref());
        let mut child = command.spawn().map_err(|e| {
            tracing::error!(
                "[Supervisor] Failed to spawn engine for channel {}: {}",
                channel_id,
                e
            );
            WardenError::process_launch(&channel_id, e.to_string())
        })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            let _ = child.start_kill();
            return Err(WardenError::process_launch(
                &channel_id,
                "engine stdio was not captured",
            ));
        };

        let pid = child.id();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let alive = Arc::new(AtomicBool::new(true));
        let interrupt_requested = Arc::new(AtomicBool::new(false));
        let interrupt_reason = Arc::new(OnceLock::new());
        let (exited_tx, exited_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let handle = ChannelProcessHandle {
            channel_id: channel_id.clone(),
            pid,
            generation,
            alive: Arc::clone(&alive),
            interrupt_requested: Arc::clone(&interrupt_requested),
            interrupt_reason: Arc::clone(&interrupt_reason),
            cancel: cancel.clone(),
            exited: exited_rx,
        };
        registry.insert(channel_id.clone(), handle);
        drop(registry);

        tracing::info!(
            "[Supervisor] Started turn on channel {} (pid {:?}, generation {})",
            channel_id,
            pid,
            generation
        );

        let stderr_task = tokio::spawn(forward_stderr(
            stderr,
            events_tx.clone(),
            channel_id.clone(),
        ));

        let task = TurnTask {
            channel_id: channel_id.clone(),
            generation,
            pid,
            cancel,
            alive,
            interrupt_requested,
            interrupt_reason,
            exited_tx,
            events_tx,
            registry: Arc::clone(&self.registry),
            grace: self.options.interrupt_grace,
            kill_wait: self.options.kill_wait,
            markers,
        };
        tokio::spawn(task.run(child, stdout, stderr_task));

        Ok(TurnHandle {
            channel_id,
            pid,
            generation,
            events: events_rx,
        })
    }

    fn build_command(
        &self,
        runtime: &RuntimeDiscovery,
        launch: &ChannelLaunch,
        turn: &TurnRequest,
        temp_dir: Option<&PathBuf>,
    ) -> Command {
        let mut command = Command::new(&runtime.path);
        command
            .arg(self.options.absolute_bridge_script())
            .arg("send")
            .arg(&turn.message)
            .arg(launch.session_id.as_deref().unwrap_or(""))
            .arg(&launch.cwd)
            .arg(turn.permission_mode.to_string())
            .current_dir(&launch.cwd)
            .env(ENV_PROJECT_PATH, &launch.cwd)
            .env(ENV_CHANNEL_ID, &launch.channel_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        if let Some(path) = augmented_path(
            std::env::var_os("PATH").as_deref(),
            runtime.path.parent(),
            dirs::home_dir().as_deref(),
        ) {
            command.env("PATH", path);
        }
        if let Some(dir) = &self.options.mailbox_dir {
            command.env(ENV_PERMISSION_DIR, dir);
        }
        if let Some(dir) = temp_dir {
            command.env("TMPDIR", dir).env("TEMP", dir).env("TMP", dir);
        }
        for (key, value) in &self.options.extra_env {
            command.env(key, value);
        }
        command
    }

    async fn prepare_temp_dir(&self, channel_id: &str) -> Option<PathBuf> {
        let root = self.options.engine_temp_root.as_ref()?;
        let stem: String = channel_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let dir = root.join(stem);
        match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => Some(dir),
            Err(e) => {
                tracing::warn!(
                    "[Supervisor] Could not create temp dir {}: {}; inheriting host temp",
                    dir.display(),
                    e
                );
                None
            }
        }
    }

    /// Interrupts the turn running on `channel_id`.
    ///
    /// Sends a polite stop to the process group, waits the grace window,
    /// then kills the group. Returns once the exit has been observed.
    /// A second call for the same turn returns `NotRunning`, and so does a
    /// call that arrives after the process already exited on its own.
    pub async fn interrupt(&self, channel_id: &str) -> InterruptOutcome {
        self.interrupt_turn(channel_id, None).await
    }

    /// Interrupts like [`interrupt`](Self::interrupt) and reports `reason`
    /// in the turn's `Interrupted` outcome.
    pub async fn interrupt_with_reason(&self, channel_id: &str, reason: &str) -> InterruptOutcome {
        self.interrupt_turn(channel_id, Some(reason)).await
    }

    async fn interrupt_turn(&self, channel_id: &str, reason: Option<&str>) -> InterruptOutcome {
        let handle = self.registry.read().await.get(channel_id).cloned();
        let Some(handle) = handle else {
            return InterruptOutcome::NotRunning;
        };
        if !handle.is_alive() || !handle.claim_interrupt() {
            return InterruptOutcome::NotRunning;
        }

        tracing::info!(
            "[Supervisor] Interrupting channel {} (pid {:?})",
            channel_id,
            handle.pid
        );
        if let Some(reason) = reason {
            let _ = handle.interrupt_reason.set(reason.to_string());
        }
        handle.cancel.cancel();

        if !handle.wait_exited(self.options.exit_budget()).await {
            tracing::warn!(
                "[Supervisor] Channel {} did not confirm exit within {:?}",
                channel_id,
                self.options.exit_budget()
            );
        }
        remove_generation(&self.registry, channel_id, handle.generation).await;
        InterruptOutcome::Interrupted
    }

    /// Stops every running turn and empties the registry.
    ///
    /// Returns the number of processes that were running.
    pub async fn cleanup_all(&self) -> usize {
        let handles: Vec<ChannelProcessHandle> =
            self.registry.read().await.values().cloned().collect();
        if handles.is_empty() {
            return 0;
        }

        tracing::info!("[Supervisor] Cleaning up {} engine process(es)", handles.len());

        let budget = self.options.exit_budget();
        join_all(handles.iter().map(|handle| async move {
            handle.claim_interrupt();
            handle.cancel.cancel();
            if !handle.wait_exited(budget).await {
                tracing::warn!(
                    "[Supervisor] Channel {} did not confirm exit during cleanup",
                    handle.channel_id
                );
            }
        }))
        .await;

        self.registry.write().await.clear();
        handles.len()
    }

    pub async fn is_running(&self, channel_id: &str) -> bool {
        self.registry
            .read()
            .await
            .get(channel_id)
            .is_some_and(|h| h.is_alive())
    }

    pub async fn active_process_count(&self) -> usize {
        self.registry
            .read()
            .await
            .values()
            .filter(|h| h.is_alive())
            .count()
    }
}

#[async_trait]
impl TurnInterrupter for ProcessSupervisor {
    async fn interrupt(&self, channel_id: &str) -> InterruptOutcome {
        ProcessSupervisor::interrupt(self, channel_id).await
    }

    async fn interrupt_with_reason(&self, channel_id: &str, reason: &str) -> InterruptOutcome {
        ProcessSupervisor::interrupt_with_reason(self, channel_id, reason).await
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // Turn tasks own their children; cancelling makes them terminate.
        if let Ok(registry) = self.registry.try_read() {
            for handle in registry.values() {
                handle.cancel.cancel();
            }
        }
    }
}

async fn remove_generation(registry: &Registry, channel_id: &str, generation: u64) {
    let mut registry = registry.write().await;
    if registry
        .get(channel_id)
        .is_some_and(|h| h.generation == generation)
    {
        registry.remove(channel_id);
    }
}

/// Owns one engine child for the lifetime of a turn.
struct TurnTask {
    channel_id: String,
    generation: u64,
    pid: Option<u32>,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
    interrupt_requested: Arc<AtomicBool>,
    interrupt_reason: Arc<OnceLock<String>>,
    exited_tx: watch::Sender<bool>,
    events_tx: mpsc::UnboundedSender<TurnEvent>,
    registry: Registry,
    grace: Duration,
    kill_wait: Duration,
    markers: Option<TempMarkers>,
}

impl TurnTask {
    async fn run(self, mut child: Child, stdout: ChildStdout, stderr_task: JoinHandle<()>) {
        let stdout_task = tokio::spawn(forward_stdout(
            stdout,
            self.events_tx.clone(),
            self.channel_id.clone(),
        ));

        let (status, exited_first) = tokio::select! {
            status = child.wait() => (status, true),
            _ = self.cancel.cancelled() => {
                let status =
                    process::terminate(&mut child, self.pid, self.grace, self.kill_wait).await;
                (status, false)
            }
        };
        // An exit that beats every interrupt claims the turn, so a late
        // interrupt finds nothing to do.
        let exited_on_its_own =
            exited_first && !self.interrupt_requested.swap(true, Ordering::SeqCst);
        if exited_first && !exited_on_its_own {
            // The interrupter claimed the turn first; its cancel follows the
            // reason, so waiting for it makes the reason visible.
            let _ = tokio::time::timeout(self.grace, self.cancel.cancelled()).await;
        }
        self.alive.store(false, Ordering::SeqCst);
        process::reap_stragglers(self.pid);

        // Grandchildren can keep the pipes open after the leader exited.
        for (label, task) in [("stdout", stdout_task), ("stderr", stderr_task)] {
            let abort = task.abort_handle();
            if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await.is_err() {
                tracing::warn!(
                    "[Supervisor] {} of channel {} still open after exit, abandoning",
                    label,
                    self.channel_id
                );
                abort.abort();
            }
        }

        let _ = self.exited_tx.send(true);
        remove_generation(&self.registry, &self.channel_id, self.generation).await;

        let outcome = if !exited_on_its_own {
            TurnOutcome::Interrupted {
                reason: self.interrupt_reason.get().cloned(),
            }
        } else {
            match status {
                Ok(status) if status.success() => TurnOutcome::Completed,
                Ok(status) => TurnOutcome::failed(format!("Engine exited with {status}"), status.code()),
                Err(e) => TurnOutcome::failed(format!("Failed to wait for engine: {e}"), None),
            }
        };

        if let Some(markers) = &self.markers {
            markers.cleanup();
        }

        tracing::info!(
            "[Supervisor] Turn on channel {} finished: {:?}",
            self.channel_id,
            outcome
        );
        let _ = self.events_tx.send(TurnEvent::Finished(outcome));
    }
}

/// Reads newline-terminated chunks, tolerating invalid UTF-8.
async fn for_each_line<R, F>(stream: R, channel_id: &str, label: &str, mut f: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                f(line.trim_end_matches('\n'));
            }
            Err(e) => {
                tracing::warn!(
                    "[Supervisor] {} read failed on channel {}: {}",
                    label,
                    channel_id,
                    e
                );
                break;
            }
        }
    }
}

async fn forward_stdout(
    stdout: ChildStdout,
    events: mpsc::UnboundedSender<TurnEvent>,
    channel_id: String,
) {
    let mut decoder = StreamDecoder::new();
    for_each_line(stdout, &channel_id, "stdout", |line| {
        match decoder.decode_line(line) {
            Ok(Some(DecodedLine::Event(event))) => {
                let _ = events.send(TurnEvent::Stream(event));
            }
            Ok(Some(DecodedLine::Diagnostic(text))) => {
                tracing::debug!(
                    target: ENGINE_LOG_TARGET,
                    channel_id = %channel_id,
                    stream = "stdout",
                    "{}",
                    text
                );
                let _ = events.send(TurnEvent::Diagnostic(text));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    "[Supervisor] Skipping malformed line on channel {}: {}",
                    channel_id,
                    e
                );
            }
        }
    })
    .await;
}

async fn forward_stderr<R>(stderr: R, events: mpsc::UnboundedSender<TurnEvent>, channel_id: String)
where
    R: AsyncRead + Unpin,
{
    for_each_line(stderr, &channel_id, "stderr", |line| {
        if line.trim().is_empty() {
            return;
        }
        tracing::debug!(
            target: ENGINE_LOG_TARGET,
            channel_id = %channel_id,
            stream = "stderr",
            "{}",
            line
        );
        let _ = events.send(TurnEvent::Diagnostic(line.to_string()));
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_export_the_permission_timeout() {
        let mut config = WardenConfig::default();
        config.permission.timeout_secs = 180;

        let options = SupervisorOptions::from_config(&config);

        assert!(
            options
                .extra_env
                .contains(&(ENV_PERMISSION_TIMEOUT_SECS.to_string(), "180".to_string()))
        );
    }
}
