//! The engine stdout protocol: legacy tagged lines and versioned frames.

pub mod event;
pub mod frame;

pub use event::{StreamEvent, StreamEventKind};
pub use frame::{FRAME_VERSION, Frame};
