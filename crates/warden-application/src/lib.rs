//! Application layer for Warden.
//!
//! Coordinates the engine supervisor and the permission mailboxes into
//! conversations: [`session`] folds turns into sessions, [`permission`]
//! arbitrates tool requests.

pub mod permission;
pub mod session;

pub use permission::{BrokerOptions, PermissionBroker, PermissionNotification, PermissionService};
pub use session::{SessionController, SessionObserver, SessionStateMachine};
