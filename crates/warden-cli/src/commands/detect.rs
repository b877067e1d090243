use std::process::ExitCode;

use anyhow::Result;
use colored::Colorize;
use warden_core::WardenError;
use warden_infrastructure::ConfigService;

pub async fn execute(config_service: &ConfigService, json: bool) -> Result<ExitCode> {
    let config = config_service.load()?;
    let locator = super::runtime_locator(&config);

    match locator.discover().await {
        Ok(found) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&found)?);
            } else {
                println!("{} {}", "Runtime:".bright_green(), found.path.display());
                println!("{} {}", "Version:".bright_green(), found.version);
                println!("{} {}", "Found via:".bright_green(), found.method);
                println!("{}", "Candidates tried:".bright_black());
                for candidate in &found.attempted {
                    println!("  {}", candidate.bright_black());
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(WardenError::RuntimeNotFound { attempted }) => {
            if json {
                let report = serde_json::json!({ "found": false, "attempted": attempted });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                eprintln!(
                    "{}",
                    format!("'{}' not found", locator.executable_name()).red()
                );
                for candidate in &attempted {
                    eprintln!("  {}", candidate.bright_black());
                }
                eprintln!(
                    "{}",
                    "Set runtime.executable in the config file or WARDEN_RUNTIME.".yellow()
                );
            }
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}
