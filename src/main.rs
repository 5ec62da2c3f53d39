//! wsbox - workspace sandboxes for coding agents
//!
//! Thin binary entry point that delegates to the handlers in `cli`.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use wsbox_core::{Dependencies, Executor};

mod cli;

use cli::{Cli, Commands};

const DEFAULT_LOG_FILTER: &str = "wsbox=info,wsbox_core=info";

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env (non-fatal if missing)
    dotenvy::dotenv().ok();

    let args = Cli::parse();
    initialize_tracing();

    match &args.command {
        Commands::Tools { json } => {
            cli::handle_tools_command(*json)?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Profiles { json } => {
            cli::handle_profiles_command(&args.load_config()?, *json)?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Config => {
            cli::handle_config_command(&args.load_config()?)?;
            return Ok(ExitCode::SUCCESS);
        }
        Commands::Serve | Commands::Call { .. } => {}
    }

    let loaded = args.load_config()?;
    let deps = Dependencies::from_config(loaded.config).context("failed to prepare the engine")?;
    let executor = Executor::new(deps).context("failed to open the engine")?;

    match &args.command {
        Commands::Serve => cli::handle_serve_command(executor).await?,
        Commands::Call { tool, args: raw } => {
            if !cli::handle_call_command(executor, tool, raw).await? {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Tools { .. } | Commands::Profiles { .. } | Commands::Config => {}
    }
    Ok(ExitCode::SUCCESS)
}

/// Logs go to stderr so stdout stays reserved for tool results.
fn initialize_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if let Err(error) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
    {
        eprintln!("failed to initialize tracing: {error}");
    }
}
