use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, ensure};
use serde::{Deserialize, Serialize};

use crate::profiles::ProfileConfig;

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Directory holding `sandboxes/<uuid>/...`.
    #[serde(default = "EngineConfig::default_engine_root")]
    pub engine_root: PathBuf,

    /// Isolation profile applied when a call does not name one.
    #[serde(default = "EngineConfig::default_isolation_profile")]
    pub default_isolation_profile: String,

    #[serde(default)]
    pub process: ProcessConfig,

    #[serde(default)]
    pub overlay: OverlayConfig,

    #[serde(default)]
    pub driver: DriverConfig,

    #[serde(default)]
    pub vcs: VcsConfig,

    /// Resource limits applied to every launch.
    #[serde(default)]
    pub limits: ResourceLimitsConfig,

    /// User-defined isolation profiles, loaded next to the builtins.
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_root: Self::default_engine_root(),
            default_isolation_profile: Self::default_isolation_profile(),
            process: ProcessConfig::default(),
            overlay: OverlayConfig::default(),
            driver: DriverConfig::default(),
            vcs: VcsConfig::default(),
            limits: ResourceLimitsConfig::default(),
            profiles: Vec::new(),
        }
    }
}

impl EngineConfig {
    fn default_engine_root() -> PathBuf {
        dirs::data_local_dir()
            .map(|dir| dir.join("wsbox"))
            .unwrap_or_else(|| PathBuf::from(".wsbox"))
    }

    fn default_isolation_profile() -> String {
        "restricted".to_string()
    }

    /// Convenience constructor used by tests and embedders.
    pub fn with_root(engine_root: impl Into<PathBuf>) -> Self {
        Self {
            engine_root: engine_root.into(),
            ..Self::default()
        }
    }

    /// Directory that contains one subdirectory per sandbox.
    pub fn sandboxes_dir(&self) -> PathBuf {
        self.engine_root.join("sandboxes")
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.default_isolation_profile.trim().is_empty(),
            "default_isolation_profile must not be empty"
        );
        self.process.validate()?;
        self.driver.validate()?;

        let mut seen = std::collections::BTreeSet::new();
        for profile in &self.profiles {
            ensure!(!profile.id.trim().is_empty(), "profiles[].id must not be empty");
            ensure!(
                seen.insert(profile.id.as_str()),
                "duplicate isolation profile id '{}'",
                profile.id
            );
        }
        Ok(())
    }
}

/// Process execution and retention settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessConfig {
    /// How long exited processes stay queryable (seconds, floor of 900).
    #[serde(default = "ProcessConfig::default_retention_seconds")]
    pub retention_seconds: u64,
    /// Wall-clock bound for `execute_command` when the call omits one.
    #[serde(default = "ProcessConfig::default_timeout_seconds")]
    pub default_timeout_seconds: u64,
    /// Delay between SIGTERM and SIGKILL.
    #[serde(default = "ProcessConfig::default_kill_grace_seconds")]
    pub kill_grace_seconds: u64,
    /// Per-stream capture limit for synchronous execution.
    #[serde(default = "ProcessConfig::default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Longest single line written to a process log.
    #[serde(default = "ProcessConfig::default_max_log_line_bytes")]
    pub max_log_line_bytes: usize,
    /// Lines returned by `get_process_logs` without `tail_lines`.
    #[serde(default = "ProcessConfig::default_tail_lines")]
    pub default_tail_lines: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            retention_seconds: Self::default_retention_seconds(),
            default_timeout_seconds: Self::default_timeout_seconds(),
            kill_grace_seconds: Self::default_kill_grace_seconds(),
            max_output_bytes: Self::default_max_output_bytes(),
            max_log_line_bytes: Self::default_max_log_line_bytes(),
            default_tail_lines: Self::default_tail_lines(),
        }
    }
}

impl ProcessConfig {
    pub const MIN_RETENTION_SECONDS: u64 = 900;
    const MAX_KILL_GRACE_SECONDS: u64 = 60;

    const fn default_retention_seconds() -> u64 {
        Self::MIN_RETENTION_SECONDS
    }

    const fn default_timeout_seconds() -> u64 {
        60
    }

    const fn default_kill_grace_seconds() -> u64 {
        5
    }

    const fn default_max_output_bytes() -> usize {
        1024 * 1024
    }

    const fn default_max_log_line_bytes() -> usize {
        64 * 1024
    }

    const fn default_tail_lines() -> usize {
        100
    }

    /// Retention window with the 15 minute floor applied.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_seconds.max(Self::MIN_RETENTION_SECONDS))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_seconds)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.default_timeout_seconds > 0,
            "process.default_timeout_seconds must be at least 1"
        );
        ensure!(
            self.kill_grace_seconds <= Self::MAX_KILL_GRACE_SECONDS,
            "process.kill_grace_seconds must be at most {} seconds",
            Self::MAX_KILL_GRACE_SECONDS
        );
        ensure!(
            self.max_output_bytes >= 1024,
            "process.max_output_bytes must be at least 1024"
        );
        ensure!(
            self.max_log_line_bytes >= 256,
            "process.max_log_line_bytes must be at least 256"
        );
        if self.retention_seconds < Self::MIN_RETENTION_SECONDS {
            tracing::warn!(
                configured = self.retention_seconds,
                floor = Self::MIN_RETENTION_SECONDS,
                "process retention below floor; using the floor"
            );
        }
        Ok(())
    }
}

/// How sandbox layers are provisioned.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverlayMode {
    /// Try a kernel overlay mount, fall back to the copy layer.
    #[default]
    Auto,
    /// Require a kernel overlay mount.
    Kernel,
    /// Always use the copy layer.
    Copy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OverlayConfig {
    #[serde(default)]
    pub mode: OverlayMode,
    /// Entry names never materialized into a sandbox nor diffed.
    #[serde(default = "OverlayConfig::default_exclude")]
    pub exclude: Vec<String>,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            mode: OverlayMode::default(),
            exclude: Self::default_exclude(),
        }
    }
}

impl OverlayConfig {
    fn default_exclude() -> Vec<String> {
        vec![".git".to_string()]
    }
}

/// Which sandbox driver launches processes.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    /// Bubblewrap when `bwrap` is available, host otherwise.
    #[default]
    Auto,
    Bubblewrap,
    /// Plain child processes confined only by working directory and rlimits.
    Host,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub kind: DriverKind,
    /// Explicit path to the `bwrap` binary.
    #[serde(default)]
    pub bwrap_path: Option<PathBuf>,
    /// Where the merged view appears inside the namespace.
    #[serde(default = "DriverConfig::default_workspace_mount")]
    pub workspace_mount: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            kind: DriverKind::default(),
            bwrap_path: None,
            workspace_mount: Self::default_workspace_mount(),
        }
    }
}

impl DriverConfig {
    fn default_workspace_mount() -> String {
        "/workspace".to_string()
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.workspace_mount.starts_with('/'),
            "driver.workspace_mount must be an absolute path"
        );
        Ok(())
    }
}

/// Host version-control settings used on approval.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VcsConfig {
    /// Append a `Sandbox-Id:` trailer to approval commits.
    #[serde(default)]
    pub commit_trailer: bool,
    /// Domain used to synthesize the author e-mail from the actor name.
    #[serde(default = "VcsConfig::default_author_email_domain")]
    pub author_email_domain: String,
    /// Let repository commit hooks run.
    #[serde(default)]
    pub run_hooks: bool,
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            commit_trailer: false,
            author_email_domain: Self::default_author_email_domain(),
            run_hooks: false,
        }
    }
}

impl VcsConfig {
    fn default_author_email_domain() -> String {
        "wsbox.local".to_string()
    }
}

/// Resource limits, `0` meaning "inherit from the engine".
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ResourceLimitsConfig {
    #[serde(default)]
    pub cpu_time_seconds: u64,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub open_files: u64,
    #[serde(default)]
    pub processes: u64,
}
