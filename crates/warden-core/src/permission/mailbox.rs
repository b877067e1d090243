use std::time::Duration;

use async_trait::async_trait;

use super::model::{MailboxRequest, MailboxResponse};
use crate::error::Result;

/// What a transport hands to the deciding side.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundRequest {
    Request(MailboxRequest),
    /// Something arrived for `channel_id` but could not be parsed. It still
    /// needs a deny, addressed by channel since there is no request id.
    Malformed { channel_id: String, message: String },
}

/// Deciding side of a permission mailbox.
///
/// Implementations deliver each request at most once and accept at most one
/// response per request id.
#[async_trait]
pub trait PermissionMailbox: Send + Sync {
    /// Waits for the next inbound request.
    ///
    /// Returns `Ok(None)` once the mailbox is closed and no more requests
    /// will arrive.
    async fn next_request(&self) -> Result<Option<InboundRequest>>;

    /// Delivers the answer for a previously received request.
    ///
    /// # Errors
    ///
    /// Returns `WardenError::Mailbox` if the executing side is gone or the
    /// request is unknown to the transport.
    async fn respond(&self, response: MailboxResponse) -> Result<()>;

    /// Short transport name used in logs.
    fn transport(&self) -> &'static str;
}

/// Executing side of a permission mailbox.
#[async_trait]
pub trait PermissionClient: Send + Sync {
    /// Raises a request and blocks until it is answered.
    ///
    /// If no answer arrives within `timeout` the client gives up and returns
    /// a deny response; it never errors for a missing answer.
    async fn request(&self, request: MailboxRequest, timeout: Duration)
    -> Result<MailboxResponse>;
}
