use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;
use wsbox_config::LoadedConfig;
use wsbox_core::ToolName;
use wsbox_core::profiles::ProfileStore;

pub fn handle_tools_command(as_json: bool) -> Result<()> {
    if as_json {
        let tools: Vec<_> = ToolName::ALL
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.as_str(),
                    "tier": tool.tier(),
                    "description": tool.description(),
                    "required": tool.required_args(),
                    "optional": tool.optional_args(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }

    for tool in ToolName::ALL {
        println!(
            "{:<20} {:<10} {}",
            tool.as_str(),
            tool.tier().as_str(),
            tool.description()
        );
        println!("{:<20} {:<10} requires: {}", "", "", tool.required_args().join(", "));
    }
    Ok(())
}

pub fn handle_profiles_command(loaded: &LoadedConfig, as_json: bool) -> Result<()> {
    let store = ProfileStore::load(&loaded.config.profiles)?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(store.all())?);
        return Ok(());
    }

    let default = &loaded.config.default_isolation_profile;
    for profile in store.all() {
        let marker = if &profile.id == default { "*" } else { " " };
        let origin = if profile.builtin { "builtin" } else { "user" };
        let network = if profile.network_access { "network" } else { "no-network" };
        println!(
            "{marker} {:<14} {:<8} {:<11} {}",
            profile.id, origin, network, profile.description
        );
    }
    Ok(())
}

pub fn handle_config_command(loaded: &LoadedConfig) -> Result<()> {
    let source = loaded
        .source
        .as_deref()
        .map(Path::display)
        .map(|path| path.to_string())
        .unwrap_or_else(|| "defaults".to_string());
    println!("# source: {source}");
    let rendered =
        toml::to_string_pretty(&loaded.config).context("failed to render configuration")?;
    print!("{rendered}");
    Ok(())
}
