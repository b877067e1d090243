//! Engine process execution for Warden.
//!
//! - [`runtime`] finds the executable that hosts the engine bridge
//! - [`workdir`] picks the directory a turn runs in
//! - [`stream`] decodes the engine's line protocol
//! - [`supervisor`] spawns, watches and terminates per-channel engines

pub mod diagnostics_layer;
pub mod runtime;
pub mod stream;
pub mod supervisor;
pub mod workdir;

pub use diagnostics_layer::{EngineDiagnostic, EngineDiagnosticsLayer};
pub use runtime::{DiscoveryMethod, RuntimeDiscovery, RuntimeLocator};
pub use stream::{DecodedLine, StreamDecoder};
pub use supervisor::{
    ChannelLaunch, ProcessSupervisor, SupervisorOptions, TurnEvent, TurnHandle, TurnRequest,
};
pub use workdir::WorkingDirectoryResolver;
