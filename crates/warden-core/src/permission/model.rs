use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{Display, EnumString};

/// Global permission policy.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PermissionMode {
    /// Ask the host unless a remembered decision applies.
    #[default]
    Default,
    /// Allow every request without asking.
    AllowAll,
    /// Deny every request without asking.
    DenyAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn from_allow(allow: bool) -> Self {
        if allow { Self::Allow } else { Self::Deny }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// What produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResolutionSource {
    Memory,
    GlobalMode,
    User,
    Timeout,
    Cancelled,
    /// The request could not be parsed.
    Malformed,
}

pub const REASON_REMEMBERED_DENY: &str = "Previously denied by user";
pub const REASON_GLOBAL_DENY: &str = "Denied by global permission mode";
pub const REASON_USER_DENY: &str = "Denied by user";
pub const REASON_TIMEOUT: &str = "Permission request timed out";
pub const REASON_CANCELLED: &str = "All requests cancelled";
pub const REASON_SUPERSEDED: &str = "Superseded by a newer request";

/// The final answer to a permission request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub decision: Decision,
    /// Denial reason handed back to the engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub source: ResolutionSource,
}

impl Resolution {
    pub fn allow(source: ResolutionSource) -> Self {
        Self {
            decision: Decision::Allow,
            reason: None,
            source,
        }
    }

    pub fn deny(source: ResolutionSource, reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Deny,
            reason: Some(reason.into()),
            source,
        }
    }

    pub fn is_allow(&self) -> bool {
        self.decision.is_allow()
    }
}

/// Lifecycle of a [`ToolPermissionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RequestState {
    Created,
    Pending,
    Resolved(Resolution),
}

/// A request from the engine to run a sensitive tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolPermissionRequest {
    pub id: String,
    pub channel_id: String,
    pub tool_name: String,
    pub inputs: Map<String, Value>,
    /// Rule updates the engine suggests applying alongside an allow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Value>,
    pub created_at: String,
    state: RequestState,
}

impl ToolPermissionRequest {
    pub fn new(
        channel_id: impl Into<String>,
        tool_name: impl Into<String>,
        inputs: Map<String, Value>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            tool_name: tool_name.into(),
            inputs,
            suggestions: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            state: RequestState::Created,
        }
    }

    pub fn state(&self) -> &RequestState {
        &self.state
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state, RequestState::Resolved(_))
    }

    pub fn resolution(&self) -> Option<&Resolution> {
        match &self.state {
            RequestState::Resolved(resolution) => Some(resolution),
            _ => None,
        }
    }

    /// Moves a freshly created request to `Pending`.
    ///
    /// Returns `false` (and changes nothing) unless the request is `Created`.
    pub fn mark_pending(&mut self) -> bool {
        if self.state != RequestState::Created {
            return false;
        }
        self.state = RequestState::Pending;
        true
    }

    /// Resolves the request.
    ///
    /// A request is resolved exactly once; later calls return `false` and
    /// leave the first resolution in place.
    pub fn resolve(&mut self, resolution: Resolution) -> bool {
        if self.is_resolved() {
            return false;
        }
        self.state = RequestState::Resolved(resolution);
        true
    }
}

/// Request descriptor exchanged through a permission mailbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailboxRequest {
    pub request_id: String,
    pub channel_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Value>,
    #[serde(default)]
    pub created_at: String,
}

impl MailboxRequest {
    pub fn new(
        channel_id: impl Into<String>,
        tool_name: impl Into<String>,
        inputs: Map<String, Value>,
    ) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.into(),
            tool_name: tool_name.into(),
            inputs,
            suggestions: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Converts the wire descriptor into a broker-side request, keeping its id.
    pub fn into_request(self) -> ToolPermissionRequest {
        let mut request = ToolPermissionRequest::new(self.channel_id, self.tool_name, self.inputs);
        request.id = self.request_id;
        request.suggestions = self.suggestions;
        if !self.created_at.is_empty() {
            request.created_at = self.created_at;
        }
        request
    }
}

/// Response descriptor exchanged through a permission mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxResponse {
    pub request_id: String,
    pub channel_id: String,
    pub allow: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MailboxResponse {
    pub fn from_resolution(request: &MailboxRequest, resolution: &Resolution) -> Self {
        Self {
            request_id: request.request_id.clone(),
            channel_id: request.channel_id.clone(),
            allow: resolution.is_allow(),
            message: resolution.reason.clone(),
        }
    }

    pub fn deny(request: &MailboxRequest, message: impl Into<String>) -> Self {
        Self {
            request_id: request.request_id.clone(),
            channel_id: request.channel_id.clone(),
            allow: false,
            message: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_resolves_exactly_once() {
        let mut request = ToolPermissionRequest::new("ch-1", "Write", Map::new());
        assert_eq!(request.state(), &RequestState::Created);
        assert!(request.mark_pending());
        assert!(!request.mark_pending());

        assert!(request.resolve(Resolution::allow(ResolutionSource::User)));
        assert!(!request.resolve(Resolution::deny(ResolutionSource::Timeout, REASON_TIMEOUT)));
        assert!(request.resolution().unwrap().is_allow());
    }

    #[test]
    fn test_permission_mode_strings() {
        assert_eq!(PermissionMode::DenyAll.to_string(), "deny_all");
        assert_eq!("allow_all".parse::<PermissionMode>().unwrap(), PermissionMode::AllowAll);
        assert!("sometimes".parse::<PermissionMode>().is_err());
    }

    #[test]
    fn test_mailbox_request_keeps_id_through_conversion() {
        let inputs = json!({"file_path": "/tmp/a"}).as_object().cloned().unwrap();
        let descriptor = MailboxRequest::new("ch-9", "Edit", inputs.clone());
        let id = descriptor.request_id.clone();
        let request = descriptor.into_request();
        assert_eq!(request.id, id);
        assert_eq!(request.inputs, inputs);
        assert_eq!(request.channel_id, "ch-9");
    }

    #[test]
    fn test_mailbox_response_wire_format() {
        let request = MailboxRequest::new("ch-1", "Bash", Map::new());
        let response = MailboxResponse::deny(&request, REASON_USER_DENY);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["allow"], false);
        assert_eq!(value["message"], "Denied by user");

        let parsed: MailboxResponse = serde_json::from_str(
            r#"{"request_id":"r","channel_id":"c","allow":true}"#,
        )
        .unwrap();
        assert!(parsed.allow);
        assert!(parsed.message.is_none());
    }
}
