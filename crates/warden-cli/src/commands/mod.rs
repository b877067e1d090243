pub mod ask;
pub mod config;
pub mod detect;
pub mod run;

use std::path::PathBuf;

use anyhow::Result;
use warden_core::config::WardenConfig;
use warden_execution::RuntimeLocator;
use warden_infrastructure::ConfigService;

pub fn config_service(path: Option<PathBuf>) -> Result<ConfigService> {
    Ok(match path {
        Some(path) => ConfigService::with_path(path),
        None => ConfigService::new()?,
    })
}

pub fn runtime_locator(config: &WardenConfig) -> RuntimeLocator {
    RuntimeLocator::new(config.runtime.executable_name.clone())
        .with_configured(config.runtime.executable.clone())
        .with_verify_timeout(config.runtime.verify_timeout())
}
