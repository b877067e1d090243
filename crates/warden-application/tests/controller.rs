#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Map;
use tempfile::TempDir;
use warden_application::{
    BrokerOptions, PermissionBroker, SessionController, SessionObserver, SessionStateMachine,
};
use warden_core::permission::{PermissionMode, ResolutionSource, ToolPermissionRequest};
use warden_core::session::{Message, MessageKind, Session, SessionStatus};
use warden_core::{TurnInterrupter, TurnOutcome, WardenError};
use warden_execution::{ProcessSupervisor, RuntimeLocator, SupervisorOptions, WorkingDirectoryResolver};

const FAKE_RUNTIME: &str = r#"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "v20.0.0-test"
  exit 0
fi
exec /bin/sh "$@"
"#;

/// Announces a session on the first turn and echoes the resumed id after.
const FAKE_ENGINE: &str = r#"
case "$2" in
  hang)
    echo "[MESSAGE_START]"
    sleep 30
    ;;
  crash)
    echo "engine exploded" >&2
    exit 2
    ;;
  *)
    if [ -z "$3" ]; then
      echo "[SESSION_ID] sess-first"
    else
      echo "[SESSION_ID] sess-other"
    fi
    echo '[MESSAGE] {"type":"system","subtype":"init"}'
    echo "[MESSAGE_START]"
    echo "[CONTENT_DELTA] resumed="
    echo "[CONTENT_DELTA] $3"
    echo "[MESSAGE_END]"
    ;;
esac
"#;

struct Fixture {
    dir: TempDir,
    supervisor: Arc<ProcessSupervisor>,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let runtime = dir.path().join("fake-runtime");
    std::fs::write(&runtime, FAKE_RUNTIME).unwrap();
    std::fs::set_permissions(&runtime, std::fs::Permissions::from_mode(0o755)).unwrap();
    let script = dir.path().join("engine.sh");
    std::fs::write(&script, FAKE_ENGINE).unwrap();

    let locator = RuntimeLocator::new("fake-runtime")
        .with_configured(Some(runtime))
        .with_known_paths(Vec::new())
        .with_path_var(None)
        .with_locate_command(false)
        .with_fallback(false);
    let options = SupervisorOptions {
        bridge_script: script,
        interrupt_grace: Duration::from_secs(1),
        kill_wait: Duration::from_secs(2),
        ..SupervisorOptions::default()
    };
    let supervisor = Arc::new(ProcessSupervisor::new(
        locator,
        WorkingDirectoryResolver::empty(),
        options,
    ));
    Fixture { dir, supervisor }
}

impl Fixture {
    fn controller(&self, channel_id: &str) -> SessionController {
        let session = Session::new(self.dir.path().to_path_buf(), PermissionMode::Default);
        SessionController::new(
            channel_id,
            self.supervisor.clone(),
            SessionStateMachine::new(session),
        )
    }
}

#[derive(Default)]
struct StatusLog(Mutex<Vec<SessionStatus>>);

impl SessionObserver for StatusLog {
    fn on_state_changed(&self, status: &SessionStatus) {
        self.0.lock().unwrap().push(status.clone());
    }
}

#[tokio::test]
async fn test_first_session_id_is_reused_by_later_turns() {
    let fx = fixture();
    let controller = fx.controller("ch-1");

    let outcome = controller.send("hello").await.unwrap();
    assert_eq!(outcome, TurnOutcome::Completed);
    assert_eq!(controller.snapshot().await.id.as_deref(), Some("sess-first"));

    controller.send("again").await.unwrap();
    let session = controller.snapshot().await;
    // The resumed turn saw the first id and could not replace it.
    assert_eq!(session.id.as_deref(), Some("sess-first"));

    let assistant: Vec<&Message> = session
        .messages
        .iter()
        .filter(|m| m.kind == MessageKind::Assistant)
        .collect();
    assert_eq!(assistant.len(), 2);
    assert_eq!(assistant[0].content, "resumed=");
    assert_eq!(assistant[1].content, "resumed=sess-first");
    assert_eq!(session.messages.len(), 4);
    assert!(!session.status.busy);
}

#[tokio::test]
async fn test_engine_crash_reports_one_error() {
    let fx = fixture();
    let controller = fx.controller("ch-crash");
    let log = Arc::new(StatusLog::default());
    controller.add_observer(log.clone()).await;

    let outcome = controller.send("crash").await.unwrap();
    assert!(matches!(
        outcome,
        TurnOutcome::Failed {
            exit_code: Some(2),
            ..
        }
    ));

    let session = controller.snapshot().await;
    let errors = session
        .messages
        .iter()
        .filter(|m| m.kind == MessageKind::Error)
        .count();
    assert_eq!(errors, 1);
    assert!(session.status.error.is_some());
    let statuses = log.0.lock().unwrap();
    assert_eq!(statuses.iter().filter(|s| s.error.is_some()).count(), 1);

    // The session stays usable.
    drop(statuses);
    assert_eq!(controller.send("hello").await.unwrap(), TurnOutcome::Completed);
    assert!(controller.snapshot().await.status.error.is_none());
}

#[tokio::test]
async fn test_missing_directory_fails_the_turn_not_the_session() {
    let fx = fixture();
    let controller = fx.controller("ch-dir");
    controller
        .set_cwd(PathBuf::from("/definitely/not/here"))
        .await;

    let outcome = controller.send("hello").await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Failed { .. }));
    assert!(!controller.snapshot().await.status.busy);

    controller.set_cwd(fx.dir.path().to_path_buf()).await;
    assert_eq!(controller.send("hello").await.unwrap(), TurnOutcome::Completed);
}

#[tokio::test]
async fn test_permission_timeout_interrupts_the_running_turn() {
    let fx = fixture();
    let controller = Arc::new(fx.controller("ch-perm"));
    let timeout = Duration::from_millis(300);
    let interrupter: Arc<dyn TurnInterrupter> = fx.supervisor.clone();
    let broker = PermissionBroker::new(BrokerOptions {
        timeout,
        ..BrokerOptions::default()
    })
    .with_interrupter(interrupter);

    let turn = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.send("hang").await })
    };
    for _ in 0..200 {
        if fx.supervisor.is_running("ch-perm").await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(controller.snapshot().await.status.busy);

    let started = Instant::now();
    let resolution = broker
        .submit(ToolPermissionRequest::new("ch-perm", "Bash", Map::new()))
        .await;
    assert_eq!(resolution.source, ResolutionSource::Timeout);

    let outcome = turn.await.unwrap().unwrap();
    let reason = WardenError::permission_timeout("ch-perm").to_string();
    assert_eq!(outcome, TurnOutcome::interrupted_because(reason.clone()));
    let grace = fx.supervisor.options().interrupt_grace;
    assert!(started.elapsed() < timeout + grace + Duration::from_secs(3));
    assert!(!fx.supervisor.is_running("ch-perm").await);

    // The timeout is reported in the session exactly once.
    let session = controller.snapshot().await;
    let notices: Vec<&Message> = session
        .messages
        .iter()
        .filter(|m| m.kind == MessageKind::System || m.kind == MessageKind::Error)
        .collect();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].kind, MessageKind::System);
    assert_eq!(notices[0].content, reason);
    assert!(!session.status.busy);
}

#[tokio::test]
async fn test_busy_session_rejects_second_send_and_history_load() {
    let fx = fixture();
    let controller = Arc::new(fx.controller("ch-busy"));

    let turn = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.send("hang").await })
    };
    for _ in 0..200 {
        if fx.supervisor.is_running("ch-busy").await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(controller.send("again").await.unwrap_err().is_channel_busy());
    assert!(controller.load_history(Vec::new()).await.is_err());

    controller.interrupt().await;
    assert_eq!(turn.await.unwrap().unwrap(), TurnOutcome::interrupted());

    controller
        .load_history(vec![Message::user("restored")])
        .await
        .unwrap();
    assert_eq!(controller.snapshot().await.messages.len(), 1);
}
