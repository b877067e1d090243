//! Engine runtime discovery.

pub mod locator;

pub use locator::{
    DEFAULT_VERIFY_TIMEOUT, DiscoveryMethod, RuntimeDiscovery, RuntimeLocator,
    default_known_paths, verify_runtime,
};
