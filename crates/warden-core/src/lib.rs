pub mod config;
pub mod error;
pub mod permission;
pub mod protocol;
pub mod session;
pub mod turn;

// Re-export common error type
pub use error::{Result, WardenError};
pub use turn::{InterruptOutcome, TurnInterrupter, TurnOutcome};
