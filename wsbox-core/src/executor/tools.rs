use std::fmt;
use std::str::FromStr;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolTier {
    Lifecycle,
    Exec,
    Files,
    Diff,
}

impl ToolTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolTier::Lifecycle => "lifecycle",
            ToolTier::Exec => "exec",
            ToolTier::Files => "files",
            ToolTier::Diff => "diff",
        }
    }
}

/// Every tool the executor accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    CreateSandbox,
    GetSandbox,
    ListSandboxes,
    DeleteSandbox,
    StartSandbox,
    StopSandbox,
    ExecuteCommand,
    StartProcess,
    GetProcessStatus,
    ListProcesses,
    StopProcess,
    GetProcessLogs,
    ListFiles,
    ReadFile,
    WriteFile,
    DeleteFile,
    CreateDirectory,
    GetDiff,
    ApproveChanges,
    RejectChanges,
    DiscardFiles,
}

impl ToolName {
    pub const ALL: [ToolName; 21] = [
        ToolName::CreateSandbox,
        ToolName::GetSandbox,
        ToolName::ListSandboxes,
        ToolName::DeleteSandbox,
        ToolName::StartSandbox,
        ToolName::StopSandbox,
        ToolName::ExecuteCommand,
        ToolName::StartProcess,
        ToolName::GetProcessStatus,
        ToolName::ListProcesses,
        ToolName::StopProcess,
        ToolName::GetProcessLogs,
        ToolName::ListFiles,
        ToolName::ReadFile,
        ToolName::WriteFile,
        ToolName::DeleteFile,
        ToolName::CreateDirectory,
        ToolName::GetDiff,
        ToolName::ApproveChanges,
        ToolName::RejectChanges,
        ToolName::DiscardFiles,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::CreateSandbox => "create_sandbox",
            ToolName::GetSandbox => "get_sandbox",
            ToolName::ListSandboxes => "list_sandboxes",
            ToolName::DeleteSandbox => "delete_sandbox",
            ToolName::StartSandbox => "start_sandbox",
            ToolName::StopSandbox => "stop_sandbox",
            ToolName::ExecuteCommand => "execute_command",
            ToolName::StartProcess => "start_process",
            ToolName::GetProcessStatus => "get_process_status",
            ToolName::ListProcesses => "list_processes",
            ToolName::StopProcess => "stop_process",
            ToolName::GetProcessLogs => "get_process_logs",
            ToolName::ListFiles => "list_files",
            ToolName::ReadFile => "read_file",
            ToolName::WriteFile => "write_file",
            ToolName::DeleteFile => "delete_file",
            ToolName::CreateDirectory => "create_directory",
            ToolName::GetDiff => "get_diff",
            ToolName::ApproveChanges => "approve_changes",
            ToolName::RejectChanges => "reject_changes",
            ToolName::DiscardFiles => "discard_files",
        }
    }

    pub fn tier(self) -> ToolTier {
        use ToolName::*;
        match self {
            CreateSandbox | GetSandbox | ListSandboxes | DeleteSandbox | StartSandbox
            | StopSandbox => ToolTier::Lifecycle,
            ExecuteCommand | StartProcess | GetProcessStatus | ListProcesses | StopProcess
            | GetProcessLogs => ToolTier::Exec,
            ListFiles | ReadFile | WriteFile | DeleteFile | CreateDirectory => ToolTier::Files,
            GetDiff | ApproveChanges | RejectChanges | DiscardFiles => ToolTier::Diff,
        }
    }

    pub fn required_args(self) -> &'static [&'static str] {
        use ToolName::*;
        match self {
            CreateSandbox => &["scope_path"],
            ListSandboxes => &[],
            GetSandbox | DeleteSandbox | StartSandbox | StopSandbox | ListProcesses | ListFiles
            | GetDiff | ApproveChanges | RejectChanges => &["sandbox_id"],
            ExecuteCommand | StartProcess => &["sandbox_id", "command"],
            GetProcessStatus | StopProcess | GetProcessLogs => &["sandbox_id", "pid"],
            ReadFile | WriteFile | DeleteFile | CreateDirectory => &["sandbox_id", "path"],
            DiscardFiles => &["sandbox_id", "files"],
        }
    }

    pub fn optional_args(self) -> &'static [&'static str] {
        use ToolName::*;
        match self {
            CreateSandbox => &["project_root", "owner", "owner_type", "no_lock", "metadata"],
            ListSandboxes => &["owner", "project_root", "status", "limit", "offset"],
            DeleteSandbox => &["force"],
            ExecuteCommand => &["args", "working_dir", "env", "timeout_sec", "isolation_profile"],
            StartProcess => &["args", "working_dir", "env", "isolation_profile"],
            GetProcessLogs => &["tail_lines", "stream"],
            ListFiles => &["path", "recursive", "include_hidden", "pattern"],
            ReadFile => &["encoding", "start_line", "end_line"],
            WriteFile => &["content", "encoding", "create_dirs", "mode"],
            DeleteFile => &["recursive"],
            CreateDirectory => &["parents", "mode"],
            GetDiff => &["include_diff"],
            ApproveChanges => &["commit_message", "actor", "files", "mode"],
            RejectChanges | DiscardFiles => &["actor"],
            GetSandbox | StartSandbox | StopSandbox | GetProcessStatus | ListProcesses
            | StopProcess => &[],
        }
    }

    pub fn description(self) -> &'static str {
        use ToolName::*;
        match self {
            CreateSandbox => "Create a sandbox over a subtree of a project",
            GetSandbox => "Fetch one sandbox record",
            ListSandboxes => "List sandboxes, newest first",
            DeleteSandbox => "Delete a sandbox and everything it owns",
            StartSandbox => "Resume a stopped sandbox",
            StopSandbox => "Stop a sandbox and its processes",
            ExecuteCommand => "Run a command to completion inside a sandbox",
            StartProcess => "Start a background process inside a sandbox",
            GetProcessStatus => "Status of a tracked process",
            ListProcesses => "Tracked processes of a sandbox",
            StopProcess => "Stop a tracked process",
            GetProcessLogs => "Tail the output of a tracked process",
            ListFiles => "List entries of a sandbox directory",
            ReadFile => "Read a file from a sandbox",
            WriteFile => "Write a file in a sandbox",
            DeleteFile => "Delete a file or directory in a sandbox",
            CreateDirectory => "Create a directory in a sandbox",
            GetDiff => "Changes made in a sandbox",
            ApproveChanges => "Promote changes to the host tree as one commit",
            RejectChanges => "Throw away every change",
            DiscardFiles => "Revert selected paths",
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolName {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        ToolName::ALL
            .into_iter()
            .find(|tool| tool.as_str() == value)
            .ok_or_else(|| format!("unknown tool '{value}'"))
    }
}
