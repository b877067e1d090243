use anyhow::{Context, Result};
use colored::Colorize;
use warden_core::config::WardenConfig;
use warden_infrastructure::ConfigService;

/// Prints the configuration after environment overrides.
pub fn show(config_service: &ConfigService) -> Result<()> {
    let config = config_service.load()?;
    let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
    print!("{}", rendered);
    Ok(())
}

pub fn path(config_service: &ConfigService) {
    println!("{}", config_service.path().display());
}

pub fn init(config_service: &ConfigService, force: bool) -> Result<()> {
    let path = config_service.path();
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    config_service.save(&WardenConfig::default())?;
    println!("{} {}", "Wrote".bright_green(), path.display());
    Ok(())
}
