use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A user-defined isolation profile as written in `[[profiles]]`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ProfileConfig {
    pub id: String,
    /// Display name; falls back to `id`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub network_access: bool,
    #[serde(default)]
    pub read_only_binds: Vec<BindConfig>,
    #[serde(default)]
    pub read_write_binds: Vec<BindConfig>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

impl ProfileConfig {
    /// Empty profile with only an id, handy when building configs in code.
    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            description: String::new(),
            network_access: false,
            read_only_binds: Vec::new(),
            read_write_binds: Vec::new(),
            environment: BTreeMap::new(),
            hostname: None,
        }
    }
}

/// A host path exposed inside the sandbox.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BindConfig {
    pub host: PathBuf,
    /// Path inside the sandbox; defaults to `host`.
    #[serde(default)]
    pub target: Option<PathBuf>,
    /// Skip the bind instead of failing when `host` does not exist.
    #[serde(default)]
    pub optional: bool,
}
