//! Unix-domain-socket permission mailbox.
//!
//! Each executing-side connection sends length-prefixed `MailboxRequest`
//! frames and receives the matching `MailboxResponse` on the same
//! connection. Responses are correlated by request id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warden_core::permission::model::REASON_TIMEOUT;
use warden_core::permission::{
    InboundRequest, MailboxRequest, MailboxResponse, PermissionClient, PermissionMailbox,
};
use warden_core::{Result, WardenError};

use super::framing::{read_frame, write_frame};

type Waiters = Arc<Mutex<HashMap<String, oneshot::Sender<MailboxResponse>>>>;

const REQUEST_QUEUE_DEPTH: usize = 64;

/// Deciding side of the socket mailbox.
pub struct SocketMailbox {
    socket_path: PathBuf,
    requests: Mutex<mpsc::Receiver<MailboxRequest>>,
    waiters: Waiters,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl SocketMailbox {
    /// Binds the socket (replacing a stale one) and starts accepting.
    pub async fn bind(socket_path: impl Into<PathBuf>) -> Result<Self> {
        let socket_path = socket_path.into();
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            WardenError::mailbox(format!("Failed to bind {}: {}", socket_path.display(), e))
        })?;

        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let waiters: Waiters = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        let accept_task = tokio::spawn(accept_loop(
            listener,
            tx,
            Arc::clone(&waiters),
            shutdown.clone(),
        ));

        tracing::info!("[SocketMailbox] Listening on {}", socket_path.display());

        Ok(Self {
            socket_path,
            requests: Mutex::new(rx),
            waiters,
            shutdown,
            accept_task,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Stops accepting, drops open connections and removes the socket file.
    pub fn close(&self) {
        self.shutdown.cancel();
        self.accept_task.abort();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

impl Drop for SocketMailbox {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    listener: UnixListener,
    tx: mpsc::Sender<MailboxRequest>,
    waiters: Waiters,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(handle_connection(
                        stream,
                        tx.clone(),
                        Arc::clone(&waiters),
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!("[SocketMailbox] Accept failed: {}", e);
                }
            }
        }
    }
    tracing::debug!("[SocketMailbox] Accept loop stopped");
}

async fn handle_connection(
    mut stream: UnixStream,
    tx: mpsc::Sender<MailboxRequest>,
    waiters: Waiters,
    shutdown: CancellationToken,
) {
    loop {
        let request: MailboxRequest = tokio::select! {
            _ = shutdown.cancelled() => return,
            frame = read_frame(&mut stream) => match frame {
                Ok(Some(request)) => request,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!("[SocketMailbox] Dropping connection: {}", e);
                    return;
                }
            }
        };

        let request_id = request.request_id.clone();
        let (reply_tx, reply_rx) = oneshot::channel();
        waiters.lock().await.insert(request_id.clone(), reply_tx);

        if tx.send(request).await.is_err() {
            waiters.lock().await.remove(&request_id);
            return;
        }

        let response = tokio::select! {
            _ = shutdown.cancelled() => None,
            reply = reply_rx => reply.ok(),
        };

        let Some(response) = response else {
            waiters.lock().await.remove(&request_id);
            return;
        };

        if let Err(e) = write_frame(&mut stream, &response).await {
            tracing::warn!(
                "[SocketMailbox] Could not deliver response for {}: {}",
                request_id,
                e
            );
            return;
        }
    }
}

#[async_trait]
impl PermissionMailbox for SocketMailbox {
    async fn next_request(&self) -> Result<Option<InboundRequest>> {
        let mut requests = self.requests.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Ok(None),
            request = requests.recv() => Ok(request.map(InboundRequest::Request)),
        }
    }

    async fn respond(&self, response: MailboxResponse) -> Result<()> {
        let waiter = self.waiters.lock().await.remove(&response.request_id);
        let Some(waiter) = waiter else {
            return Err(WardenError::mailbox(format!(
                "No open connection waiting for request {}",
                response.request_id
            )));
        };
        waiter.send(response).map_err(|response| {
            WardenError::mailbox(format!(
                "Executing side disconnected before request {} was answered",
                response.request_id
            ))
        })
    }

    fn transport(&self) -> &'static str {
        "socket"
    }
}

/// Executing side of the socket mailbox. Opens one connection per request.
#[derive(Debug, Clone)]
pub struct SocketMailboxClient {
    socket_path: PathBuf,
}

impl SocketMailboxClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }
}

#[async_trait]
impl PermissionClient for SocketMailboxClient {
    async fn request(
        &self,
        request: MailboxRequest,
        timeout: Duration,
    ) -> Result<MailboxResponse> {
        let mut stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            WardenError::mailbox(format!(
                "Failed to connect to {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;
        write_frame(&mut stream, &request).await?;

        match tokio::time::timeout(timeout, read_frame::<_, MailboxResponse>(&mut stream)).await {
            Ok(Ok(Some(response))) => Ok(response),
            Ok(Ok(None)) => Ok(MailboxResponse::deny(
                &request,
                "Permission mailbox closed the connection",
            )),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!(
                    "[SocketMailboxClient] No answer for {} within {:?}, denying",
                    request.request_id,
                    timeout
                );
                Ok(MailboxResponse::deny(&request, REASON_TIMEOUT))
            }
        }
    }
}
