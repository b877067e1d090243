//! Tool permission requests, remembered decisions and the mailbox seam.

pub mod catalog;
pub mod mailbox;
pub mod memory;
pub mod model;

pub use catalog::{RiskLevel, ToolRiskCatalog};
pub use mailbox::{InboundRequest, PermissionClient, PermissionMailbox};
pub use memory::{DEFAULT_MEMORY_CAPACITY, DEFAULT_MEMORY_TTL, PermissionMemory, memory_key};
pub use model::{
    Decision, MailboxRequest, MailboxResponse, PermissionMode, RequestState, Resolution,
    ResolutionSource, ToolPermissionRequest,
};
