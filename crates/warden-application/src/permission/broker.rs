//! Permission policy on top of the mailbox transports.
//!
//! Every request goes through the same state machine:
//! global mode, then remembered decisions, then the host. Requests that
//! reach the host are answered by [`PermissionBroker::decide`] or denied
//! when the timeout elapses, so nothing stays pending forever. Every deny
//! interrupts the turn that asked.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast, oneshot};
use warden_core::{TurnInterrupter, WardenError};
use warden_core::config::PermissionConfig;
use warden_core::permission::model::{
    REASON_CANCELLED, REASON_GLOBAL_DENY, REASON_REMEMBERED_DENY, REASON_SUPERSEDED,
    REASON_TIMEOUT, REASON_USER_DENY,
};
use warden_core::permission::{
    DEFAULT_MEMORY_CAPACITY, DEFAULT_MEMORY_TTL, MailboxRequest, MailboxResponse, PermissionMemory,
    PermissionMode, Resolution, ResolutionSource, RiskLevel, ToolPermissionRequest,
    ToolRiskCatalog, memory_key,
};

const NOTIFICATION_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// How long a request may wait for the host before it is denied.
    pub timeout: Duration,
    /// Never remember, nor answer from memory, for high-risk tools.
    pub always_ask_high_risk: bool,
    pub memory_capacity: usize,
    pub memory_ttl: Duration,
    pub mode: PermissionMode,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            always_ask_high_risk: false,
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            memory_ttl: DEFAULT_MEMORY_TTL,
            mode: PermissionMode::Default,
        }
    }
}

impl BrokerOptions {
    pub fn from_config(config: &PermissionConfig) -> Self {
        Self {
            timeout: config.timeout(),
            always_ask_high_risk: config.always_ask_high_risk,
            memory_capacity: config.memory_capacity,
            memory_ttl: config.memory_ttl(),
            mode: config.default_mode,
        }
    }
}

/// Broadcast to every subscriber of [`PermissionBroker::subscribe`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PermissionNotification {
    /// The host has to decide.
    Pending {
        request: ToolPermissionRequest,
        risk: RiskLevel,
    },
    Resolved {
        request_id: String,
        channel_id: String,
        resolution: Resolution,
    },
}

struct PendingEntry {
    request: ToolPermissionRequest,
    memory_key: String,
    responder: oneshot::Sender<Resolution>,
}

pub struct PermissionBroker {
    options: BrokerOptions,
    mode: RwLock<PermissionMode>,
    memory: Mutex<PermissionMemory>,
    /// At most one request waits for the host per channel.
    pending: Mutex<HashMap<String, PendingEntry>>,
    notifications: broadcast::Sender<PermissionNotification>,
    interrupter: Option<Arc<dyn TurnInterrupter>>,
    catalog: ToolRiskCatalog,
}

impl PermissionBroker {
    pub fn new(options: BrokerOptions) -> Self {
        let (notifications, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            mode: RwLock::new(options.mode),
            memory: Mutex::new(PermissionMemory::new(
                options.memory_capacity,
                options.memory_ttl,
            )),
            pending: Mutex::new(HashMap::new()),
            notifications,
            interrupter: None,
            catalog: ToolRiskCatalog::new(),
            options,
        }
    }

    /// Sets what gets interrupted when a request is denied.
    pub fn with_interrupter(mut self, interrupter: Arc<dyn TurnInterrupter>) -> Self {
        self.interrupter = Some(interrupter);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PermissionNotification> {
        self.notifications.subscribe()
    }

    pub async fn mode(&self) -> PermissionMode {
        *self.mode.read().await
    }

    pub async fn set_mode(&self, mode: PermissionMode) {
        tracing::info!("[Broker] Permission mode set to {}", mode);
        *self.mode.write().await = mode;
    }

    pub async fn clear_memory(&self) -> usize {
        let cleared = self.memory.lock().await.clear();
        tracing::info!("[Broker] Forgot {} remembered decision(s)", cleared);
        cleared
    }

    pub async fn clear_tool_memory(&self, tool_name: &str) -> usize {
        let cleared = self.memory.lock().await.clear_tool(tool_name);
        tracing::info!(
            "[Broker] Forgot {} remembered decision(s) for '{}'",
            cleared,
            tool_name
        );
        cleared
    }

    /// Requests currently waiting for the host.
    pub async fn pending_requests(&self) -> Vec<ToolPermissionRequest> {
        let mut requests: Vec<ToolPermissionRequest> = self
            .pending
            .lock()
            .await
            .values()
            .map(|entry| entry.request.clone())
            .collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        requests
    }

    /// Resolves `request` and returns how.
    ///
    /// Resolves without involving the host when the global mode or a
    /// remembered decision applies. Otherwise notifies subscribers and waits
    /// for [`decide`](Self::decide), at most the configured timeout.
    pub async fn submit(&self, mut request: ToolPermissionRequest) -> Resolution {
        let key = memory_key(&request.tool_name, &request.inputs);
        let resolution = match self.resolve_without_host(&request, &key).await {
            Some(resolution) => resolution,
            None => self.ask_host(&mut request, key).await,
        };

        request.resolve(resolution.clone());
        // A superseded request's channel is still busy with the newer one.
        if !resolution.is_allow() && resolution.reason.as_deref() != Some(REASON_SUPERSEDED) {
            let reason = match resolution.source {
                ResolutionSource::Timeout => {
                    WardenError::permission_timeout(&request.channel_id).to_string()
                }
                _ => resolution
                    .reason
                    .clone()
                    .unwrap_or_else(|| REASON_USER_DENY.to_string()),
            };
            self.interrupt_turn(&request.channel_id, reason);
        }
        resolution
    }

    /// Answers a request received through a mailbox transport.
    pub async fn handle_mailbox_request(&self, request: MailboxRequest) -> MailboxResponse {
        let resolution = self.submit(request.clone().into_request()).await;
        MailboxResponse::from_resolution(&request, &resolution)
    }

    /// Denies a request the transport could not parse and interrupts the
    /// turn on its channel, like any other deny.
    pub async fn reject_malformed(&self, channel_id: &str, message: &str) -> MailboxResponse {
        tracing::warn!("[Broker] Denying on {}: {}", channel_id, message);
        let resolution = Resolution::deny(ResolutionSource::Malformed, message);
        let _ = self.notifications.send(PermissionNotification::Resolved {
            request_id: String::new(),
            channel_id: channel_id.to_string(),
            resolution,
        });
        self.interrupt_turn(channel_id, message.to_string());
        MailboxResponse {
            request_id: String::new(),
            channel_id: channel_id.to_string(),
            allow: false,
            message: Some(message.to_string()),
        }
    }

    async fn resolve_without_host(
        &self,
        request: &ToolPermissionRequest,
        key: &str,
    ) -> Option<Resolution> {
        match self.mode().await {
            PermissionMode::AllowAll => {
                tracing::debug!(
                    "[Broker] Allowing '{}' on {} (global mode)",
                    request.tool_name,
                    request.channel_id
                );
                return Some(Resolution::allow(ResolutionSource::GlobalMode));
            }
            PermissionMode::DenyAll => {
                tracing::info!(
                    "[Broker] Denying '{}' on {} (global mode)",
                    request.tool_name,
                    request.channel_id
                );
                return Some(Resolution::deny(
                    ResolutionSource::GlobalMode,
                    REASON_GLOBAL_DENY,
                ));
            }
            PermissionMode::Default => {}
        }

        if self.skips_memory(&request.tool_name) {
            return None;
        }
        let remembered = self.memory.lock().await.lookup(key)?;
        tracing::debug!(
            "[Broker] Remembered decision for '{}': allow={}",
            request.tool_name,
            remembered
        );
        Some(if remembered {
            Resolution::allow(ResolutionSource::Memory)
        } else {
            Resolution::deny(ResolutionSource::Memory, REASON_REMEMBERED_DENY)
        })
    }

    fn skips_memory(&self, tool_name: &str) -> bool {
        self.options.always_ask_high_risk && self.catalog.is_high_risk(tool_name)
    }

    async fn ask_host(&self, request: &mut ToolPermissionRequest, key: String) -> Resolution {
        request.mark_pending();
        let (tx, mut rx) = oneshot::channel();
        let request_id = request.id.clone();
        let channel_id = request.channel_id.clone();

        {
            let mut pending = self.pending.lock().await;
            let entry = PendingEntry {
                request: request.clone(),
                memory_key: key,
                responder: tx,
            };
            if let Some(previous) = pending.insert(channel_id.clone(), entry) {
                tracing::warn!(
                    "[Broker] Request {} on {} superseded by {}",
                    previous.request.id,
                    channel_id,
                    request_id
                );
                let _ = previous.responder.send(Resolution::deny(
                    ResolutionSource::Cancelled,
                    REASON_SUPERSEDED,
                ));
            }
        }

        tracing::info!(
            "[Broker] Asking host about '{}' on {} ({})",
            request.tool_name,
            channel_id,
            request_id
        );
        let _ = self.notifications.send(PermissionNotification::Pending {
            request: request.clone(),
            risk: self.catalog.risk_level(&request.tool_name),
        });

        let resolution = match tokio::time::timeout(self.options.timeout, &mut rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => Resolution::deny(ResolutionSource::Cancelled, REASON_CANCELLED),
            Err(_) => self.expire(&channel_id, &request_id, &mut rx).await,
        };

        let _ = self.notifications.send(PermissionNotification::Resolved {
            request_id,
            channel_id,
            resolution: resolution.clone(),
        });
        resolution
    }

    /// Denies a request whose timeout elapsed, unless a decision slipped in.
    async fn expire(
        &self,
        channel_id: &str,
        request_id: &str,
        rx: &mut oneshot::Receiver<Resolution>,
    ) -> Resolution {
        let mut pending = self.pending.lock().await;
        if pending
            .get(channel_id)
            .is_some_and(|entry| entry.request.id == request_id)
        {
            pending.remove(channel_id);
            tracing::warn!(
                "[Broker] Request {} on {} timed out after {:?}",
                request_id,
                channel_id,
                self.options.timeout
            );
            return Resolution::deny(ResolutionSource::Timeout, REASON_TIMEOUT);
        }
        drop(pending);

        // Already taken by `decide` or `cancel_all_pending`, which always
        // answer after removing the entry.
        match rx.await {
            Ok(resolution) => resolution,
            Err(_) => Resolution::deny(ResolutionSource::Cancelled, REASON_CANCELLED),
        }
    }

    /// Records the host's decision for the request pending on `channel_id`.
    ///
    /// Returns `false` if nothing is pending there (unknown channel, or the
    /// request was already resolved).
    pub async fn decide(
        &self,
        channel_id: &str,
        allow: bool,
        remember: bool,
        reject_message: Option<String>,
    ) -> bool {
        let Some(entry) = self.pending.lock().await.remove(channel_id) else {
            tracing::debug!("[Broker] No pending request on {}", channel_id);
            return false;
        };

        if remember {
            if self.skips_memory(&entry.request.tool_name) {
                tracing::info!(
                    "[Broker] Not remembering decision for high-risk tool '{}'",
                    entry.request.tool_name
                );
            } else {
                self.memory.lock().await.remember(entry.memory_key, allow);
            }
        }

        let resolution = if allow {
            Resolution::allow(ResolutionSource::User)
        } else {
            let reason = reject_message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| REASON_USER_DENY.to_string());
            Resolution::deny(ResolutionSource::User, reason)
        };
        tracing::info!(
            "[Broker] Host decided {} for '{}' on {}",
            resolution.decision,
            entry.request.tool_name,
            channel_id
        );
        entry.responder.send(resolution).is_ok()
    }

    /// Denies every request waiting for the host. Returns how many.
    pub async fn cancel_all_pending(&self) -> usize {
        let drained: Vec<PendingEntry> = self.pending.lock().await.drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.responder.send(Resolution::deny(
                ResolutionSource::Cancelled,
                REASON_CANCELLED,
            ));
        }
        if count > 0 {
            tracing::info!("[Broker] Cancelled {} pending request(s)", count);
        }
        count
    }

    fn interrupt_turn(&self, channel_id: &str, reason: String) {
        let Some(interrupter) = self.interrupter.clone() else {
            return;
        };
        let channel_id = channel_id.to_string();
        // The mailbox answer must not wait for the process to die.
        tokio::spawn(async move {
            let outcome = interrupter
                .interrupt_with_reason(&channel_id, &reason)
                .await;
            tracing::info!(
                "[Broker] Interrupt after deny on {}: {:?}",
                channel_id,
                outcome
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, json};

    fn request(channel: &str, tool: &str, inputs: serde_json::Value) -> ToolPermissionRequest {
        let inputs: Map<String, serde_json::Value> = inputs.as_object().cloned().unwrap_or_default();
        ToolPermissionRequest::new(channel, tool, inputs)
    }

    fn broker() -> Arc<PermissionBroker> {
        broker_with(BrokerOptions {
            timeout: Duration::from_secs(5),
            ..BrokerOptions::default()
        })
    }

    fn broker_with(options: BrokerOptions) -> Arc<PermissionBroker> {
        Arc::new(PermissionBroker::new(options))
    }

    /// Submits on a background task and decides once it is pending.
    async fn submit_and_decide(
        broker: &Arc<PermissionBroker>,
        tool: &str,
        allow: bool,
        remember: bool,
    ) -> Resolution {
        let task = {
            let broker = broker.clone();
            let tool = tool.to_string();
            tokio::spawn(async move { broker.submit(request("ch", &tool, json!({"path": "/x"}))).await })
        };
        wait_pending(broker, 1).await;
        assert!(broker.decide("ch", allow, remember, None).await);
        task.await.unwrap()
    }

    async fn wait_pending(broker: &PermissionBroker, count: usize) {
        for _ in 0..200 {
            if broker.pending_requests().await.len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pending requests never reached {count}");
    }

    #[tokio::test]
    async fn test_allow_all_short_circuits() {
        let broker = broker();
        broker.set_mode(PermissionMode::AllowAll).await;
        let mut rx = broker.subscribe();

        let resolution = broker
            .submit(request("ch", "Bash", json!({"command": "ls"})))
            .await;

        assert!(resolution.is_allow());
        assert_eq!(resolution.source, ResolutionSource::GlobalMode);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_decide_unknown_channel_is_ignored() {
        let broker = broker();
        assert!(!broker.decide("nobody", true, false, None).await);
    }

    #[tokio::test]
    async fn test_user_deny_uses_supplied_message() {
        let broker = broker();
        let task = {
            let broker = broker.clone();
            tokio::spawn(async move {
                broker
                    .submit(request("ch", "Write", json!({"file_path": "/a"})))
                    .await
            })
        };
        wait_pending(&broker, 1).await;

        assert!(
            broker
                .decide("ch", false, false, Some("not that file".to_string()))
                .await
        );
        // Second decision for the same request is ignored.
        assert!(!broker.decide("ch", true, false, None).await);

        let resolution = task.await.unwrap();
        assert!(!resolution.is_allow());
        assert_eq!(resolution.reason.as_deref(), Some("not that file"));
        assert_eq!(resolution.source, ResolutionSource::User);
    }

    #[tokio::test]
    async fn test_newer_request_supersedes_older_on_same_channel() {
        let broker = broker();
        let first = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.submit(request("ch", "Write", json!({"n": 1}))).await })
        };
        wait_pending(&broker, 1).await;
        let second = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.submit(request("ch", "Write", json!({"n": 2}))).await })
        };

        let first = first.await.unwrap();
        assert_eq!(first.reason.as_deref(), Some(REASON_SUPERSEDED));

        wait_pending(&broker, 1).await;
        assert!(broker.decide("ch", true, false, None).await);
        assert!(second.await.unwrap().is_allow());
    }

    #[tokio::test]
    async fn test_high_risk_decisions_are_remembered_by_default() {
        let broker = broker();
        assert!(submit_and_decide(&broker, "Delete", true, true).await.is_allow());

        let repeated = broker
            .submit(request("ch", "Delete", json!({"path": "/x"})))
            .await;
        assert!(repeated.is_allow());
        assert_eq!(repeated.source, ResolutionSource::Memory);
    }

    #[tokio::test]
    async fn test_always_ask_high_risk_skips_memory() {
        let broker = broker_with(BrokerOptions {
            timeout: Duration::from_secs(5),
            always_ask_high_risk: true,
            ..BrokerOptions::default()
        });
        assert!(submit_and_decide(&broker, "Delete", true, true).await.is_allow());
        assert_eq!(broker.memory.lock().await.len(), 0);

        // Low-risk tools are still remembered.
        assert!(submit_and_decide(&broker, "Read", true, true).await.is_allow());
        assert_eq!(broker.memory.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_decision_racing_the_timeout_is_delivered_once() {
        let broker = broker_with(BrokerOptions {
            timeout: Duration::from_millis(100),
            ..BrokerOptions::default()
        });
        let task = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.submit(request("ch", "Read", json!({"path": "/x"}))).await })
        };
        wait_pending(&broker, 1).await;

        // Hold the memory lock so `decide` stalls after taking the entry
        // and before answering, while the timeout elapses.
        let memory = broker.memory.lock().await;
        let decide = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.decide("ch", true, true, None).await })
        };
        wait_pending(&broker, 0).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        drop(memory);

        assert!(decide.await.unwrap());
        let resolution = task.await.unwrap();
        assert!(resolution.is_allow());
        assert_eq!(resolution.source, ResolutionSource::User);
    }

    #[tokio::test]
    async fn test_cancel_all_pending_denies_everything() {
        let broker = broker();
        let mut tasks = Vec::new();
        for channel in ["a", "b", "c"] {
            let broker = broker.clone();
            tasks.push(tokio::spawn(async move {
                broker.submit(request(channel, "Bash", json!({}))).await
            }));
        }
        wait_pending(&broker, 3).await;

        assert_eq!(broker.cancel_all_pending().await, 3);
        for task in tasks {
            let resolution = task.await.unwrap();
            assert_eq!(resolution.reason.as_deref(), Some(REASON_CANCELLED));
        }
        assert!(broker.pending_requests().await.is_empty());
    }
}
