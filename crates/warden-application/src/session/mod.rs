//! Session state and the controller that drives turns.

pub mod controller;
pub mod state_machine;

pub use controller::SessionController;
pub use state_machine::{SessionObserver, SessionStateMachine};
