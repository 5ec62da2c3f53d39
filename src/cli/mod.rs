use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use wsbox_config::{ConfigLoader, LoadedConfig};

pub mod call;
pub mod inspect;
pub mod serve;

pub use call::handle_call_command;
pub use inspect::{handle_config_command, handle_profiles_command, handle_tools_command};
pub use serve::handle_serve_command;

/// Workspace sandboxes for coding agents.
#[derive(Debug, Parser)]
#[command(name = "wsbox", version, about, long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to $WSBOX_CONFIG, then ./wsbox.toml)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Override the engine root directory
    #[arg(long, global = true, value_name = "DIR")]
    pub engine_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Serve tool calls as JSON lines on stdin/stdout
    Serve,
    /// Run a single tool call and print its result
    Call {
        /// Tool name, e.g. `create_sandbox`
        tool: String,
        /// Arguments as a JSON object
        #[arg(long, default_value = "{}")]
        args: String,
    },
    /// List the available tools
    Tools {
        #[arg(long)]
        json: bool,
    },
    /// List isolation profiles
    Profiles {
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

impl Cli {
    pub fn load_config(&self) -> Result<LoadedConfig> {
        let mut loader = ConfigLoader::new();
        if let Some(path) = &self.config {
            loader = loader.with_path(path);
        }
        let mut loaded = loader.load().context("failed to load configuration")?;
        if let Some(root) = &self.engine_root {
            loaded.config.engine_root = root.clone();
        }
        Ok(loaded)
    }
}
