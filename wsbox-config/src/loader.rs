use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::engine::EngineConfig;

/// Points at a TOML file to load instead of searching the working directory.
pub const CONFIG_ENV_VAR: &str = "WSBOX_CONFIG";
/// File name looked up in the search directory.
pub const CONFIG_FILE_NAME: &str = "wsbox.toml";
pub const ENGINE_ROOT_ENV: &str = "ENGINE_ROOT";
pub const DEFAULT_PROFILE_ENV: &str = "DEFAULT_ISOLATION_PROFILE";
pub const RETENTION_ENV: &str = "PROCESS_RETENTION_SECONDS";

/// The effective configuration plus the file it came from, if any.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: EngineConfig,
    pub source: Option<PathBuf>,
}

/// Resolves defaults, an optional TOML file, and environment overrides.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    explicit_path: Option<PathBuf>,
    search_dir: PathBuf,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            explicit_path: None,
            search_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Load this file and fail if it is missing.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit_path = Some(path.into());
        self
    }

    /// Directory searched for `wsbox.toml` when no explicit path is set.
    pub fn with_search_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.search_dir = dir.into();
        self
    }

    /// Load using the process environment.
    pub fn load(&self) -> Result<LoadedConfig> {
        self.load_with_env(|key| std::env::var(key).ok())
    }

    /// Load using an injected environment lookup.
    pub fn load_with_env<F>(&self, env: F) -> Result<LoadedConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let source = self.locate(&env)?;
        let mut config = match &source {
            Some(path) => Self::load_toml_from_file(path)?,
            None => EngineConfig::default(),
        };

        apply_env_overrides(&mut config, &env)?;
        config
            .validate()
            .context("invalid wsbox configuration")?;

        debug!(
            source = ?source,
            engine_root = %config.engine_root.display(),
            "configuration loaded"
        );
        Ok(LoadedConfig { config, source })
    }

    fn locate<F>(&self, env: &F) -> Result<Option<PathBuf>>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = &self.explicit_path {
            anyhow::ensure!(
                path.exists(),
                "configuration file {} does not exist",
                path.display()
            );
            return Ok(Some(path.clone()));
        }

        if let Some(value) = env(CONFIG_ENV_VAR) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                let path = PathBuf::from(trimmed);
                anyhow::ensure!(
                    path.exists(),
                    "{CONFIG_ENV_VAR}={trimmed} does not point at a file"
                );
                return Ok(Some(path));
            }
        }

        let candidate = self.search_dir.join(CONFIG_FILE_NAME);
        Ok(candidate.exists().then_some(candidate))
    }

    fn load_toml_from_file(path: &Path) -> Result<EngineConfig> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Parse a TOML document into a configuration (no env overrides).
    pub fn parse(content: &str) -> Result<EngineConfig> {
        let config: EngineConfig = toml::from_str(content)?;
        Ok(config)
    }
}

/// Apply `ENGINE_ROOT`, `DEFAULT_ISOLATION_PROFILE` and
/// `PROCESS_RETENTION_SECONDS` on top of `config`. Empty values are ignored.
pub fn apply_env_overrides<F>(config: &mut EngineConfig, env: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |key: &str| {
        env(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };

    if let Some(root) = lookup(ENGINE_ROOT_ENV) {
        config.engine_root = PathBuf::from(root);
    }
    if let Some(profile) = lookup(DEFAULT_PROFILE_ENV) {
        config.default_isolation_profile = profile;
    }
    if let Some(raw) = lookup(RETENTION_ENV) {
        config.process.retention_seconds = raw
            .parse()
            .with_context(|| format!("{RETENTION_ENV} must be a whole number of seconds, got '{raw}'"))?;
    }
    Ok(())
}
