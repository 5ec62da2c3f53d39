//! Per-tool argument shapes.
//!
//! Required fields are strict; numbers are accepted as integers, floats or
//! numeric strings.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::de::{self, DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::tools::ToolName;
use crate::error::{EngineError, EngineResult};
use crate::files::Encoding;
use crate::sandbox::{OwnerType, SandboxStatus};

/// Decode `args` for `tool`. A missing argument object counts as `{}`.
pub fn parse<T: DeserializeOwned>(tool: ToolName, args: Value) -> EngineResult<T> {
    let args = match args {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(args)
        .map_err(|err| EngineError::invalid_args(format!("{tool}: {err}")))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Numeric {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Numeric {
    fn as_f64(&self) -> Result<f64, String> {
        match self {
            Numeric::Integer(n) => Ok(*n as f64),
            Numeric::Float(n) => Ok(*n),
            Numeric::Text(text) => text
                .trim()
                .parse::<f64>()
                .map_err(|_| format!("expected a number, got '{text}'")),
        }
    }

    fn whole<T: TryFrom<u64>>(self) -> Result<T, String> {
        let n = match self {
            Numeric::Integer(n) => {
                u64::try_from(n).map_err(|_| format!("expected a non-negative integer, got {n}"))?
            }
            other => {
                let value = other.as_f64()?;
                if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value > u64::MAX as f64
                {
                    return Err(format!("expected a non-negative integer, got {value}"));
                }
                value as u64
            }
        };
        T::try_from(n).map_err(|_| format!("{n} is out of range"))
    }
}

pub(crate) fn deserialize_maybe_quoted<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    Numeric::deserialize(deserializer)?
        .whole()
        .map_err(de::Error::custom)
}

pub(crate) fn deserialize_opt_maybe_quoted<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: TryFrom<u64>,
{
    Option::<Numeric>::deserialize(deserializer)?
        .map(Numeric::whole)
        .transpose()
        .map_err(de::Error::custom)
}

/// Positive seconds, fractional allowed.
pub(crate) fn deserialize_opt_seconds<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(number) = Option::<Numeric>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let seconds = number.as_f64().map_err(de::Error::custom)?;
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(de::Error::custom("timeout must be a positive number of seconds"));
    }
    Duration::try_from_secs_f64(seconds)
        .map(Some)
        .map_err(de::Error::custom)
}

/// Octal permissions: `"0644"`, `"0o755"` or the integer `644`.
pub(crate) fn deserialize_opt_mode<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Integer(u64),
        Text(String),
    }

    let digits = match Option::<Raw>::deserialize(deserializer)? {
        None => return Ok(None),
        Some(Raw::Integer(n)) => n.to_string(),
        Some(Raw::Text(text)) => text.trim().trim_start_matches("0o").to_string(),
    };
    match u32::from_str_radix(&digits, 8) {
        Ok(mode) if mode <= 0o7777 => Ok(Some(mode)),
        _ => Err(de::Error::custom(format!(
            "mode '{digits}' is not an octal permission"
        ))),
    }
}

/// A status name or a list of them.
fn deserialize_statuses<'de, D>(deserializer: D) -> Result<Vec<SandboxStatus>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    let names = match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(name)) => vec![name],
        Some(OneOrMany::Many(names)) => names,
    };
    names
        .iter()
        .map(|name| name.parse::<SandboxStatus>().map_err(de::Error::custom))
        .collect()
}

fn yes() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct SandboxArgs {
    pub sandbox_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct CreateSandboxArgs {
    #[serde(alias = "scope")]
    pub scope_path: String,
    #[serde(default)]
    pub project_root: Option<PathBuf>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub owner_type: OwnerType,
    #[serde(default)]
    pub no_lock: bool,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
pub struct ListSandboxesArgs {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub project_root: Option<PathBuf>,
    #[serde(default, deserialize_with = "deserialize_statuses")]
    pub status: Vec<SandboxStatus>,
    #[serde(default, deserialize_with = "deserialize_opt_maybe_quoted")]
    pub limit: Option<usize>,
    #[serde(default, deserialize_with = "deserialize_opt_maybe_quoted")]
    pub offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteSandboxArgs {
    pub sandbox_id: Uuid,
    /// Tear down running processes instead of refusing.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Deserialize)]
pub struct CommandArgs {
    pub sandbox_id: Uuid,
    #[serde(alias = "cmd")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, alias = "cwd")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(
        default,
        alias = "timeout",
        alias = "timeout_secs",
        deserialize_with = "deserialize_opt_seconds"
    )]
    pub timeout_sec: Option<Duration>,
    #[serde(default, alias = "profile")]
    pub isolation_profile: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProcessArgs {
    pub sandbox_id: Uuid,
    #[serde(deserialize_with = "deserialize_maybe_quoted")]
    pub pid: u32,
}

#[derive(Debug, Deserialize)]
pub struct ProcessLogsArgs {
    pub sandbox_id: Uuid,
    #[serde(deserialize_with = "deserialize_maybe_quoted")]
    pub pid: u32,
    #[serde(default, alias = "tail", deserialize_with = "deserialize_opt_maybe_quoted")]
    pub tail_lines: Option<usize>,
    #[serde(default)]
    pub stream: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListFilesArgs {
    pub sandbox_id: Uuid,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default)]
    pub include_hidden: bool,
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReadFileArgs {
    pub sandbox_id: Uuid,
    #[serde(alias = "file_path")]
    pub path: String,
    #[serde(default)]
    pub encoding: Encoding,
    #[serde(default, deserialize_with = "deserialize_opt_maybe_quoted")]
    pub start_line: Option<usize>,
    #[serde(default, deserialize_with = "deserialize_opt_maybe_quoted")]
    pub end_line: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct WriteFileArgs {
    pub sandbox_id: Uuid,
    #[serde(alias = "file_path")]
    pub path: String,
    #[serde(default, alias = "contents")]
    pub content: String,
    #[serde(default)]
    pub encoding: Option<Encoding>,
    #[serde(default = "yes")]
    pub create_dirs: bool,
    #[serde(default, deserialize_with = "deserialize_opt_mode")]
    pub mode: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteFileArgs {
    pub sandbox_id: Uuid,
    #[serde(alias = "file_path")]
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Deserialize)]
pub struct CreateDirectoryArgs {
    pub sandbox_id: Uuid,
    pub path: String,
    #[serde(default = "yes")]
    pub parents: bool,
    #[serde(default, deserialize_with = "deserialize_opt_mode")]
    pub mode: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct GetDiffArgs {
    pub sandbox_id: Uuid,
    #[serde(default = "yes")]
    pub include_diff: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    All,
    Files,
}

#[derive(Debug, Deserialize)]
pub struct ApproveArgs {
    pub sandbox_id: Uuid,
    #[serde(default, alias = "message")]
    pub commit_message: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default, alias = "file_paths")]
    pub files: Option<Vec<String>>,
    #[serde(default)]
    pub mode: Option<ApprovalMode>,
}

impl ApproveArgs {
    /// The file selection, checked against `mode` when one is given.
    pub fn selection(&self) -> EngineResult<Option<Vec<String>>> {
        match (self.mode, &self.files) {
            (Some(ApprovalMode::All), Some(_)) => Err(EngineError::invalid_args(
                "approve_changes: mode 'all' does not take files",
            )),
            (Some(ApprovalMode::Files), None) => Err(EngineError::invalid_args(
                "approve_changes: mode 'files' requires files",
            )),
            (Some(ApprovalMode::Files), Some(files)) if files.is_empty() => Err(
                EngineError::invalid_args("approve_changes: mode 'files' requires files"),
            ),
            (_, files) => Ok(files.clone()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RejectArgs {
    pub sandbox_id: Uuid,
    #[serde(default)]
    pub actor: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DiscardArgs {
    pub sandbox_id: Uuid,
    #[serde(alias = "paths")]
    pub files: Vec<String>,
    #[serde(default)]
    pub actor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const ID: &str = "00000000-0000-4000-8000-000000000001";

    #[test]
    fn numbers_may_be_floats_or_strings() -> anyhow::Result<()> {
        let args: ProcessLogsArgs = parse(
            ToolName::GetProcessLogs,
            json!({"sandbox_id": ID, "pid": 1234.0, "tail_lines": "10"}),
        )?;
        assert_eq!(args.pid, 1234);
        assert_eq!(args.tail_lines, Some(10));

        let err = parse::<ProcessArgs>(ToolName::StopProcess, json!({"sandbox_id": ID, "pid": 1.5}))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgs(_)));
        let err = parse::<ProcessArgs>(ToolName::StopProcess, json!({"sandbox_id": ID, "pid": -3}))
            .unwrap_err();
        assert!(err.to_string().contains("non-negative"));
        Ok(())
    }

    #[test]
    fn timeouts_accept_fractions() -> anyhow::Result<()> {
        let args: CommandArgs = parse(
            ToolName::ExecuteCommand,
            json!({"sandbox_id": ID, "command": "sleep", "timeout_sec": 1.5}),
        )?;
        assert_eq!(args.timeout_sec, Some(Duration::from_millis(1500)));
        let err = parse::<CommandArgs>(
            ToolName::ExecuteCommand,
            json!({"sandbox_id": ID, "command": "sleep", "timeout_sec": 0}),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgs(_)));
        Ok(())
    }

    #[test]
    fn required_fields_are_strict() {
        let err = parse::<CommandArgs>(ToolName::ExecuteCommand, json!({"sandbox_id": ID}))
            .unwrap_err();
        assert!(err.to_string().contains("missing field `command`"));
        let err = parse::<SandboxArgs>(ToolName::GetSandbox, json!({"sandbox_id": "nope"}))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgs(_)));
        let err = parse::<SandboxArgs>(ToolName::GetSandbox, Value::Null).unwrap_err();
        assert!(err.to_string().starts_with("get_sandbox:"));
    }

    #[test]
    fn modes_are_octal() -> anyhow::Result<()> {
        for (raw, expected) in [(json!("0644"), 0o644), (json!("0o755"), 0o755), (json!(600), 0o600)] {
            let args: WriteFileArgs = parse(
                ToolName::WriteFile,
                json!({"sandbox_id": ID, "path": "a", "mode": raw}),
            )?;
            assert_eq!(args.mode, Some(expected));
            assert!(args.create_dirs);
        }
        let err = parse::<WriteFileArgs>(
            ToolName::WriteFile,
            json!({"sandbox_id": ID, "path": "a", "mode": "0899"}),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgs(_)));
        Ok(())
    }

    #[test]
    fn status_filter_takes_one_or_many() -> anyhow::Result<()> {
        let one: ListSandboxesArgs = parse(ToolName::ListSandboxes, json!({"status": "active"}))?;
        assert_eq!(one.status, vec![SandboxStatus::Active]);
        let many: ListSandboxesArgs = parse(
            ToolName::ListSandboxes,
            json!({"status": ["active", "stopped"], "limit": 5.0}),
        )?;
        assert_eq!(many.status, vec![SandboxStatus::Active, SandboxStatus::Stopped]);
        assert_eq!(many.limit, Some(5));
        assert!(parse::<ListSandboxesArgs>(ToolName::ListSandboxes, json!({"status": "paused"})).is_err());
        Ok(())
    }

    #[test]
    fn approval_mode_must_match_files() -> anyhow::Result<()> {
        let args: ApproveArgs = parse(
            ToolName::ApproveChanges,
            json!({"sandbox_id": ID, "mode": "files"}),
        )?;
        assert!(args.selection().is_err());
        let args: ApproveArgs = parse(
            ToolName::ApproveChanges,
            json!({"sandbox_id": ID, "mode": "all", "files": ["a"]}),
        )?;
        assert!(args.selection().is_err());
        let args: ApproveArgs = parse(
            ToolName::ApproveChanges,
            json!({"sandbox_id": ID, "files": ["a"]}),
        )?;
        assert_eq!(args.selection()?, Some(vec!["a".to_string()]));
        Ok(())
    }
}
