use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use warden_core::permission::PermissionMode;

mod commands;
mod logging;

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Warden - run agent turns with supervised permissions", long_about = None)]
struct Cli {
    /// Config file to use instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace); RUST_LOG wins when set
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one turn and answer permission requests interactively
    Run {
        /// Prompt sent to the engine
        prompt: String,
        /// Working directory for the engine
        #[arg(long)]
        cwd: Option<String>,
        /// Session id to resume
        #[arg(long)]
        session: Option<String>,
        /// Permission mode: default, allow_all or deny_all
        #[arg(long)]
        mode: Option<PermissionMode>,
        /// Channel id used for the mailbox and process registry
        #[arg(long, default_value = "cli")]
        channel: String,
        /// Print engine stdout noise and stderr
        #[arg(long)]
        show_engine_output: bool,
    },
    /// Locate the engine runtime and report how it was found
    Detect {
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Ask for a tool permission from the executing side
    Ask {
        /// Tool name
        tool: String,
        /// Tool inputs as a JSON object
        #[arg(long, default_value = "{}")]
        input: String,
        /// Channel id; defaults to WARDEN_CHANNEL_ID
        #[arg(long)]
        channel: Option<String>,
        /// Seconds to wait; defaults to the configured timeout plus a margin
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Inspect or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Write a config file with default values
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config_service = commands::config_service(cli.config.clone())?;

    match cli.command {
        Commands::Run {
            prompt,
            cwd,
            session,
            mode,
            channel,
            show_engine_output,
        } => {
            let diagnostics = logging::init(cli.verbose, cli.log_json, show_engine_output);
            commands::run::execute(
                &config_service,
                commands::run::RunArgs {
                    prompt,
                    cwd,
                    session,
                    mode,
                    channel,
                },
                diagnostics,
            )
            .await
        }
        Commands::Detect { json } => {
            logging::init(cli.verbose, cli.log_json, false);
            commands::detect::execute(&config_service, json).await
        }
        Commands::Ask {
            tool,
            input,
            channel,
            timeout_secs,
        } => {
            logging::init(cli.verbose, cli.log_json, false);
            commands::ask::execute(&config_service, tool, &input, channel, timeout_secs).await
        }
        Commands::Config { action } => {
            logging::init(cli.verbose, cli.log_json, false);
            match action {
                ConfigAction::Show => commands::config::show(&config_service)?,
                ConfigAction::Path => commands::config::path(&config_service),
                ConfigAction::Init { force } => commands::config::init(&config_service, force)?,
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
