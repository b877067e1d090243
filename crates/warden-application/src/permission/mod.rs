//! Permission arbitration.

pub mod broker;
pub mod service;

pub use broker::{BrokerOptions, PermissionBroker, PermissionNotification};
pub use service::PermissionService;
