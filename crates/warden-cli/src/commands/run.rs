use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use colored::Colorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use warden_application::{
    BrokerOptions, PermissionBroker, PermissionNotification, PermissionService,
    SessionController, SessionObserver, SessionStateMachine,
};
use warden_core::TurnOutcome;
use warden_core::config::{ENV_PERMISSION_SOCKET, MailboxKind, WardenConfig};
use warden_core::permission::{PermissionMailbox, PermissionMode, RiskLevel, ToolPermissionRequest};
use warden_core::session::{Message, MessageKind, Session, SessionStatus};
use warden_execution::{
    EngineDiagnostic, ProcessSupervisor, SupervisorOptions, WorkingDirectoryResolver,
};
use warden_infrastructure::WardenPaths;
use warden_infrastructure::mailbox::FsMailbox;

pub struct RunArgs {
    pub prompt: String,
    pub cwd: Option<String>,
    pub session: Option<String>,
    pub mode: Option<PermissionMode>,
    pub channel: String,
}

pub async fn execute(
    config_service: &warden_infrastructure::ConfigService,
    args: RunArgs,
    diagnostics: Option<mpsc::UnboundedReceiver<EngineDiagnostic>>,
) -> Result<ExitCode> {
    let config = config_service.load()?;
    let mode = args.mode.unwrap_or(config.permission.default_mode);

    let mailbox_dir = WardenPaths::mailbox_dir(&config);
    let (mailbox, socket_path) = open_mailbox(&config, &mailbox_dir).await?;

    let mut options =
        SupervisorOptions::from_config(&config).with_mailbox_dir(Some(mailbox_dir.clone()));
    if config.supervisor.isolate_temp_dir {
        options = options.with_engine_temp_root(Some(WardenPaths::engine_temp_dir()));
    }
    if let Some(socket) = &socket_path {
        options = options.with_env(ENV_PERMISSION_SOCKET, socket.to_string_lossy());
    }
    let supervisor = Arc::new(ProcessSupervisor::new(
        super::runtime_locator(&config),
        WorkingDirectoryResolver::from_env(),
        options,
    ));

    let broker = Arc::new(
        PermissionBroker::new(BrokerOptions::from_config(&config.permission))
            .with_interrupter(supervisor.clone()),
    );
    broker.set_mode(mode).await;
    let service = PermissionService::new(broker.clone(), mailbox);
    service.start().await;
    let prompter = tokio::spawn(answer_permission_requests(broker.clone()));
    let printer = diagnostics.map(|rx| tokio::spawn(print_diagnostics(rx)));

    let mut session = Session::new(args.cwd.map(PathBuf::from).unwrap_or_default(), mode);
    session.id = args.session.filter(|id| !id.trim().is_empty());
    let mut state =
        SessionStateMachine::new(session).with_context_limit(config.session.context_limit);
    state.add_observer(Arc::new(ConsoleObserver::default()));
    let controller = SessionController::new(args.channel, supervisor.clone(), state);

    let outcome = {
        let turn = controller.send(&args.prompt);
        tokio::pin!(turn);
        tokio::select! {
            outcome = &mut turn => outcome,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Interrupting...".yellow());
                controller.interrupt().await;
                turn.await
            }
        }
    };

    service.stop().await;
    supervisor.cleanup_all().await;
    prompter.abort();
    if let Some(printer) = printer {
        printer.abort();
    }

    let outcome = outcome?;
    let session = controller.snapshot().await;
    let usage = controller.context_usage().await;
    if let Some(id) = &session.id {
        eprintln!("{} {}", "session:".bright_black(), id.bright_black());
    }
    if usage.used_tokens > 0 {
        eprintln!(
            "{}",
            format!(
                "context: {:.1}% ({}/{} tokens)",
                usage.percentage, usage.used_tokens, usage.max_tokens
            )
            .bright_black()
        );
    }

    Ok(match outcome {
        TurnOutcome::Completed => ExitCode::SUCCESS,
        TurnOutcome::Interrupted { .. } => {
            eprintln!("{}", "Turn interrupted".yellow());
            ExitCode::from(130)
        }
        TurnOutcome::Failed { .. } => ExitCode::FAILURE,
    })
}

async fn open_mailbox(
    config: &WardenConfig,
    dir: &Path,
) -> Result<(Arc<dyn PermissionMailbox>, Option<PathBuf>)> {
    if config.permission.mailbox == MailboxKind::Socket {
        #[cfg(unix)]
        {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let path = WardenPaths::socket_path(dir);
            let mailbox = warden_infrastructure::mailbox::SocketMailbox::bind(&path).await?;
            return Ok((Arc::new(mailbox), Some(path)));
        }
        #[cfg(not(unix))]
        tracing::warn!("[Run] Socket mailbox is not supported here, using files");
    }

    let mailbox = FsMailbox::open(dir, config.permission.poll_interval()).await?;
    Ok((Arc::new(mailbox), None))
}

enum Answer {
    Allow { remember: bool },
    Deny { remember: bool },
    /// Resolved elsewhere (timeout, cancel) before the user answered.
    Settled,
}

fn parse_answer(line: &str) -> Answer {
    match line.trim().to_lowercase().as_str() {
        "y" | "yes" => Answer::Allow { remember: false },
        "a" | "always" => Answer::Allow { remember: true },
        "d" | "never" => Answer::Deny { remember: true },
        _ => Answer::Deny { remember: false },
    }
}

fn print_request(request: &ToolPermissionRequest, risk: RiskLevel) {
    let risk_label = match risk {
        RiskLevel::High => risk.to_string().red().bold(),
        RiskLevel::Controlled => risk.to_string().yellow(),
        RiskLevel::Safe | RiskLevel::Unknown => risk.to_string().normal(),
    };
    eprintln!();
    eprintln!(
        "{} {} ({})",
        "Permission requested:".bright_yellow(),
        request.tool_name.bold(),
        risk_label
    );
    for (key, value) in &request.inputs {
        let value = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        eprintln!("  {} {}", format!("{key}:").bright_black(), value);
    }
    eprint!(
        "{}",
        "Allow? [y]es / [a]lways / [n]o / [d]eny always: ".bright_yellow()
    );
    let _ = std::io::stderr().flush();
}

/// Answers pending permission requests from stdin.
async fn answer_permission_requests(broker: Arc<PermissionBroker>) {
    let mut notifications = broker.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let (request, risk) = match notifications.recv().await {
            Ok(PermissionNotification::Pending { request, risk }) => (request, risk),
            Ok(PermissionNotification::Resolved { .. }) => continue,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("[Run] Missed {} permission notification(s)", skipped);
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        print_request(&request, risk);

        let answer = loop {
            tokio::select! {
                line = lines.next_line() => {
                    break match line {
                        Ok(Some(line)) => parse_answer(&line),
                        // No terminal to ask.
                        _ => Answer::Deny { remember: false },
                    };
                }
                other = notifications.recv() => match other {
                    Ok(PermissionNotification::Resolved { request_id, resolution, .. })
                        if request_id == request.id =>
                    {
                        eprintln!(
                            "\n{} {}",
                            "Resolved without you:".bright_black(),
                            resolution.reason.unwrap_or_default().bright_black()
                        );
                        break Answer::Settled;
                    }
                    Err(RecvError::Closed) => return,
                    _ => {}
                },
            }
        };

        let (allow, remember) = match answer {
            Answer::Allow { remember } => (true, remember),
            Answer::Deny { remember } => (false, remember),
            Answer::Settled => continue,
        };
        if !broker
            .decide(&request.channel_id, allow, remember, None)
            .await
        {
            eprintln!("{}", "Request was already resolved".bright_black());
        }
    }
}

async fn print_diagnostics(mut rx: mpsc::UnboundedReceiver<EngineDiagnostic>) {
    while let Some(diagnostic) = rx.recv().await {
        eprintln!(
            "{} {}",
            format!("[{}]", diagnostic.stream).bright_black(),
            diagnostic.message.bright_black()
        );
    }
}

#[derive(Default)]
struct Printed {
    /// Messages fully printed.
    count: usize,
    /// Bytes of the in-flight message already printed.
    partial: usize,
}

/// Streams assistant output to stdout as it arrives.
#[derive(Default)]
struct ConsoleObserver {
    printed: Mutex<Printed>,
}

impl SessionObserver for ConsoleObserver {
    fn on_messages_changed(&self, messages: &[Message]) {
        let Ok(mut printed) = self.printed.lock() else {
            return;
        };
        if messages.len() < printed.count {
            printed.count = messages.len();
            printed.partial = 0;
        }

        let mut stdout = std::io::stdout();
        while let Some(message) = messages.get(printed.count) {
            match message.kind {
                MessageKind::User => {}
                MessageKind::Assistant => {
                    let new_text = message.content.get(printed.partial..).unwrap_or("");
                    let _ = write!(stdout, "{}", new_text);
                    if message.streaming {
                        printed.partial = message.content.len();
                        break;
                    }
                    let _ = writeln!(stdout);
                }
                MessageKind::System => {
                    let _ = writeln!(stdout, "{}", message.content.bright_black());
                }
                MessageKind::Error => {
                    eprintln!("{}", message.content.red());
                }
            }
            printed.count += 1;
            printed.partial = 0;
        }
        let _ = stdout.flush();
    }

    fn on_state_changed(&self, status: &SessionStatus) {
        if status.busy {
            tracing::debug!("[Run] Turn started");
        }
    }

    fn on_session_id(&self, session_id: &str) {
        tracing::info!("[Run] Session {}", session_id);
    }
}
