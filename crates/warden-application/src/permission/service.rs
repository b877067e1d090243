use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use warden_core::permission::{InboundRequest, PermissionMailbox};

use super::broker::PermissionBroker;

/// Backoff after a transport error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Pumps requests from a mailbox transport into the broker and writes the
/// answers back.
///
/// Runs on its own task, independent of engine I/O. Each request is handled
/// on a separate task so a request waiting for the host never delays
/// requests from other channels.
pub struct PermissionService {
    broker: Arc<PermissionBroker>,
    mailbox: Arc<dyn PermissionMailbox>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PermissionService {
    pub fn new(broker: Arc<PermissionBroker>, mailbox: Arc<dyn PermissionMailbox>) -> Self {
        Self {
            broker,
            mailbox,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn broker(&self) -> &Arc<PermissionBroker> {
        &self.broker
    }

    /// Starts the pump. Calling it again while running does nothing.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        tracing::info!(
            "[PermissionService] Listening on the {} mailbox",
            self.mailbox.transport()
        );
        *task = Some(tokio::spawn(pump(
            Arc::clone(&self.broker),
            Arc::clone(&self.mailbox),
            self.shutdown.clone(),
        )));
    }

    /// Stops the pump and denies whatever is still waiting for the host.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
        self.broker.cancel_all_pending().await;
        tracing::info!("[PermissionService] Stopped");
    }
}

async fn pump(
    broker: Arc<PermissionBroker>,
    mailbox: Arc<dyn PermissionMailbox>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = mailbox.next_request() => next,
        };

        match next {
            Ok(Some(inbound)) => {
                let broker = Arc::clone(&broker);
                let mailbox = Arc::clone(&mailbox);
                tokio::spawn(async move {
                    let response = match inbound {
                        InboundRequest::Request(request) => {
                            broker.handle_mailbox_request(request).await
                        }
                        InboundRequest::Malformed {
                            channel_id,
                            message,
                        } => broker.reject_malformed(&channel_id, &message).await,
                    };
                    let channel_id = response.channel_id.clone();
                    if let Err(e) = mailbox.respond(response).await {
                        tracing::warn!(
                            "[PermissionService] Could not answer on {}: {}",
                            channel_id,
                            e
                        );
                    }
                });
            }
            Ok(None) => {
                tracing::info!("[PermissionService] Mailbox closed");
                break;
            }
            Err(e) => {
                tracing::warn!("[PermissionService] Mailbox error: {}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }
}
