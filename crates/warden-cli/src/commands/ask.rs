//! Executing side of the permission mailbox.
//!
//! Meant to be called by the engine (or a shim next to it) before running a
//! sensitive tool. Prints the response as JSON on stdout and exits 0 when
//! allowed, 1 when denied.

use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use warden_core::config::{ENV_CHANNEL_ID, ENV_PERMISSION_SOCKET, WardenConfig};
use warden_core::permission::{MailboxRequest, PermissionClient};
use warden_infrastructure::mailbox::FsMailboxClient;
use warden_infrastructure::{ConfigService, WardenPaths};

/// Added to the broker's timeout so the broker's own deny arrives first.
const CLIENT_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

pub async fn execute(
    config_service: &ConfigService,
    tool: String,
    input: &str,
    channel: Option<String>,
    timeout_secs: Option<u64>,
) -> Result<ExitCode> {
    let config = config_service.load()?;

    let inputs: Map<String, Value> = match serde_json::from_str(input)
        .with_context(|| format!("--input is not valid JSON: {input}"))?
    {
        Value::Object(map) => map,
        other => anyhow::bail!("--input must be a JSON object, got {other}"),
    };
    let channel = channel
        .or_else(|| std::env::var(ENV_CHANNEL_ID).ok())
        .filter(|c| !c.trim().is_empty())
        .with_context(|| format!("No channel given and {ENV_CHANNEL_ID} is not set"))?;
    let timeout = timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.permission.timeout() + CLIENT_TIMEOUT_MARGIN);

    let request = MailboxRequest::new(channel, tool, inputs);
    let client = client_for(&config);
    let response = client.request(request, timeout).await?;

    println!("{}", serde_json::to_string(&response)?);
    Ok(if response.allow {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn client_for(config: &WardenConfig) -> Box<dyn PermissionClient> {
    #[cfg(unix)]
    {
        if let Some(socket) = std::env::var_os(ENV_PERMISSION_SOCKET).filter(|s| !s.is_empty()) {
            tracing::debug!("[Ask] Using socket {}", socket.to_string_lossy());
            return Box::new(warden_infrastructure::mailbox::SocketMailboxClient::new(
                socket,
            ));
        }
    }
    #[cfg(not(unix))]
    {
        if std::env::var_os(ENV_PERMISSION_SOCKET).is_some() {
            tracing::warn!("[Ask] Socket mailbox is not supported here, using files");
        }
    }

    let dir = WardenPaths::mailbox_dir(config);
    tracing::debug!("[Ask] Using mailbox directory {}", dir.display());
    Box::new(FsMailboxClient::new(dir, config.permission.poll_interval()))
}
