//! Cooperative-then-forced termination of engine process trees.
//!
//! Engines are spawned as process-group leaders on Unix, so signalling the
//! negative pid reaches every descendant (shell tools, language servers).

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;

/// Sends `signal` to the process group led by `pid`.
///
/// Returns `true` if the signal was delivered. A group that no longer exists
/// is not an error.
#[cfg(unix)]
pub fn signal_process_group(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // Never target init or our own group.
    if pid <= 1 {
        return false;
    }

    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc == 0 {
        return true;
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ESRCH) {
        tracing::warn!(
            "[Supervisor] Failed to signal process group {}: {}",
            pid,
            err
        );
    }
    false
}

#[cfg(windows)]
async fn taskkill(pid: u32, force: bool) {
    let mut command = tokio::process::Command::new("taskkill");
    command.arg("/PID").arg(pid.to_string()).arg("/T");
    if force {
        command.arg("/F");
    }
    command
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let Err(e) = command.status().await {
        tracing::warn!("[Supervisor] taskkill for {} failed: {}", pid, e);
    }
}

async fn request_stop(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    {
        let _ = child;
        if let Some(pid) = pid {
            signal_process_group(pid, libc::SIGTERM);
        }
    }
    #[cfg(windows)]
    {
        let _ = child;
        if let Some(pid) = pid {
            taskkill(pid, false).await;
        }
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = pid;
        let _ = child.start_kill();
    }
}

async fn force_stop(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            signal_process_group(pid, libc::SIGKILL);
        }
    }
    #[cfg(windows)]
    {
        if let Some(pid) = pid {
            taskkill(pid, true).await;
        }
    }
    #[cfg(not(any(unix, windows)))]
    let _ = pid;

    let _ = child.start_kill();
}

/// Stops `child`: polite signal, `grace` to exit, then a forced kill of the
/// whole tree and up to `kill_wait` for the child to be reaped.
///
/// # Errors
///
/// Returns an `io::ErrorKind::TimedOut` error if the child could not be
/// reaped even after the forced kill.
pub async fn terminate(
    child: &mut Child,
    pid: Option<u32>,
    grace: Duration,
    kill_wait: Duration,
) -> io::Result<ExitStatus> {
    request_stop(child, pid).await;

    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        return status;
    }

    tracing::warn!(
        "[Supervisor] Process {:?} ignored termination for {:?}, killing",
        pid,
        grace
    );
    force_stop(child, pid).await;

    match tokio::time::timeout(kill_wait, child.wait()).await {
        Ok(status) => status,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("process {:?} not reaped after forced kill", pid),
        )),
    }
}

/// Kills whatever is left of the group after its leader exited.
pub fn reap_stragglers(pid: Option<u32>) {
    #[cfg(unix)]
    {
        if let Some(pid) = pid {
            if signal_process_group(pid, libc::SIGKILL) {
                tracing::debug!("[Supervisor] Killed leftover processes of group {}", pid);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}
