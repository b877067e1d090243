//! Conversation sessions and their message log.

pub mod message;
pub mod model;
pub mod usage;

pub use message::{Message, MessageKind, envelope_text};
pub use model::{Session, SessionStatus};
pub use usage::{ContextUsage, DEFAULT_CONTEXT_LIMIT, context_usage};
