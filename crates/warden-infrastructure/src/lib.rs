pub mod config_service;
pub mod mailbox;
pub mod paths;
pub mod storage;

pub use config_service::ConfigService;
pub use paths::WardenPaths;
