//! Configuration for the wsbox engine.
//!
//! Every field carries a serde default so an empty TOML document (or no file
//! at all) yields a usable configuration. [`ConfigLoader`] layers a TOML file
//! and the `ENGINE_ROOT`, `DEFAULT_ISOLATION_PROFILE` and
//! `PROCESS_RETENTION_SECONDS` environment variables on top of the defaults.

pub mod engine;
pub mod loader;
pub mod profiles;

pub use engine::{
    DriverConfig, DriverKind, EngineConfig, OverlayConfig, OverlayMode, ProcessConfig,
    ResourceLimitsConfig, VcsConfig,
};
pub use loader::{
    CONFIG_ENV_VAR, CONFIG_FILE_NAME, ConfigLoader, DEFAULT_PROFILE_ENV, ENGINE_ROOT_ENV,
    LoadedConfig, RETENTION_ENV, apply_env_overrides,
};
pub use profiles::{BindConfig, ProfileConfig};
