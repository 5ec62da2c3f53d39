//! The sandbox record and its state machine.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::overlay::OverlayKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Active,
    Stopped,
    Approving,
    Discarded,
    Deleted,
}

impl SandboxStatus {
    pub const ALL: [SandboxStatus; 6] = [
        SandboxStatus::Creating,
        SandboxStatus::Active,
        SandboxStatus::Stopped,
        SandboxStatus::Approving,
        SandboxStatus::Discarded,
        SandboxStatus::Deleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SandboxStatus::Creating => "creating",
            SandboxStatus::Active => "active",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Approving => "approving",
            SandboxStatus::Discarded => "discarded",
            SandboxStatus::Deleted => "deleted",
        }
    }

    /// Edges of the lifecycle graph.
    pub fn can_transition(self, to: SandboxStatus) -> bool {
        use SandboxStatus::*;
        matches!(
            (self, to),
            (Creating, Active)
                | (Creating, Deleted)
                | (Active, Stopped)
                | (Stopped, Active)
                | (Active, Approving)
                | (Approving, Active)
                | (Approving, Discarded)
                | (Discarded, Active)
                | (Active, Deleted)
                | (Stopped, Deleted)
                | (Discarded, Deleted)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == SandboxStatus::Deleted
    }

    /// Whether the diff of a sandbox in this state can be inspected.
    pub fn allows_diff_read(self) -> bool {
        matches!(
            self,
            SandboxStatus::Active | SandboxStatus::Stopped | SandboxStatus::Discarded
        )
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        SandboxStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| format!("unknown sandbox status '{value}'"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnerType {
    #[default]
    Agent,
    User,
    System,
}

impl OwnerType {
    pub fn as_str(self) -> &'static str {
        match self {
            OwnerType::Agent => "agent",
            OwnerType::User => "user",
            OwnerType::System => "system",
        }
    }
}

impl FromStr for OwnerType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "agent" => Ok(OwnerType::Agent),
            "user" => Ok(OwnerType::User),
            "system" => Ok(OwnerType::System),
            other => Err(format!(
                "unknown owner_type '{other}' (expected agent, user or system)"
            )),
        }
    }
}

/// One sandbox, as persisted in `meta.json` and returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: Uuid,
    /// Subtree of `project_root` the sandbox virtualizes, `/`-separated.
    pub scope_path: String,
    pub project_root: PathBuf,
    pub owner: String,
    pub owner_type: OwnerType,
    pub status: SandboxStatus,
    #[serde(default)]
    pub no_lock: bool,
    pub lower_dir: PathBuf,
    pub upper_dir: PathBuf,
    pub work_dir: PathBuf,
    pub merged_dir: PathBuf,
    #[serde(default)]
    pub overlay_kind: OverlayKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Sandbox {
    /// Host directory the sandbox's changes are promoted into.
    pub fn host_scope_dir(&self) -> PathBuf {
        if self.scope_path == "." {
            self.project_root.clone()
        } else {
            self.project_root.join(&self.scope_path)
        }
    }

    /// Key of the one-active-sandbox rule.
    pub fn lock_key(&self) -> (&str, &std::path::Path, &str) {
        (&self.scope_path, &self.project_root, &self.owner)
    }

    /// Whether this record holds the lock for its key.
    pub fn holds_lock(&self) -> bool {
        !self.no_lock
            && matches!(
                self.status,
                SandboxStatus::Creating | SandboxStatus::Active | SandboxStatus::Approving
            )
    }
}
