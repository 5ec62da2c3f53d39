//! The seam between the engine and an isolation mechanism.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::limits::ResourceLimits;
use crate::log::LogSink;
use crate::process_group::KillSignal;

/// Exit code reported when a command is killed for exceeding its timeout.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// A host path exposed inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub host: PathBuf,
    pub target: PathBuf,
}

impl BindMount {
    pub fn same_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            host: path.clone(),
            target: path,
        }
    }
}

/// Everything a driver needs to launch one command.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    /// Host directory presented to the command as its workspace.
    pub root: PathBuf,
    /// Working directory relative to `root`.
    pub workdir: PathBuf,
    pub read_only_binds: Vec<BindMount>,
    pub read_write_binds: Vec<BindMount>,
    pub env: BTreeMap<String, String>,
    pub hostname: Option<String>,
    pub network: bool,
    pub limits: ResourceLimits,
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchSpec {
    pub fn new(root: impl Into<PathBuf>, program: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            workdir: PathBuf::new(),
            read_only_binds: Vec::new(),
            read_write_binds: Vec::new(),
            env: BTreeMap::new(),
            hostname: None,
            network: false,
            limits: ResourceLimits::default(),
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Working directory as seen from the host.
    pub fn host_workdir(&self) -> PathBuf {
        if self.workdir.as_os_str().is_empty() {
            self.root.clone()
        } else {
            self.root.join(&self.workdir)
        }
    }

    /// Program and arguments as one shell-quoted line, for logs.
    pub fn command_line(&self) -> String {
        let mut words = Vec::with_capacity(self.args.len() + 1);
        words.push(self.program.as_str());
        words.extend(self.args.iter().map(String::as_str));
        shell_words::join(words)
    }
}

/// Bounds and cancellation for a synchronous execution.
#[derive(Debug, Clone)]
pub struct ExecControl {
    pub timeout: Option<Duration>,
    pub kill_grace: Duration,
    pub max_output_bytes: usize,
    pub cancel: CancellationToken,
}

impl Default for ExecControl {
    fn default() -> Self {
        Self {
            timeout: None,
            kill_grace: Duration::from_secs(5),
            max_output_bytes: 1024 * 1024,
            cancel: CancellationToken::new(),
        }
    }
}

/// Result of a command run to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub pid: Option<u32>,
    pub timed_out: bool,
    pub cancelled: bool,
    /// Set when either stream hit `max_output_bytes`.
    pub truncated: bool,
    pub duration_ms: u64,
}

/// How a tracked process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Shell-style exit code: the code itself, or 128 plus the signal.
    pub fn exit_code(&self) -> i32 {
        match (self.code, self.signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => -1,
        }
    }

    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            Self {
                code: status.code(),
                signal: status.signal(),
            }
        }
        #[cfg(not(unix))]
        {
            Self {
                code: status.code(),
                signal: None,
            }
        }
    }
}

/// A long-running process handed to the caller. `exit` resolves once the
/// process has exited and its log has been flushed.
#[derive(Debug)]
pub struct StartedProcess {
    pub pid: u32,
    pub exit: oneshot::Receiver<ProcessExit>,
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("sandbox driver unavailable: {0}")]
    Unavailable(String),
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("working directory {} does not exist", .0.display())]
    MissingWorkdir(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DriverError {
    pub fn spawn(program: &str, source: io::Error) -> Self {
        DriverError::Spawn {
            program: program.to_string(),
            source,
        }
    }

    /// The underlying I/O error, when there is one.
    pub fn io_error(&self) -> Option<&io::Error> {
        match self {
            DriverError::Spawn { source, .. } | DriverError::Signal { source, .. } => Some(source),
            DriverError::Io(source) => Some(source),
            _ => None,
        }
    }
}

pub(crate) fn ensure_workdir(spec: &LaunchSpec) -> Result<PathBuf, DriverError> {
    let dir = spec.host_workdir();
    if Path::new(&dir).is_dir() {
        Ok(dir)
    } else {
        Err(DriverError::MissingWorkdir(dir))
    }
}

/// Runs commands for a sandbox.
///
/// Implementations must put each command in its own process group so a
/// signal reaches every descendant.
#[async_trait]
pub trait SandboxDriver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run a command to completion, honoring timeout and cancellation.
    async fn exec(&self, spec: &LaunchSpec, control: &ExecControl)
    -> Result<ExecOutput, DriverError>;

    /// Start a command in the background, streaming output into `log`.
    async fn start_process(
        &self,
        spec: &LaunchSpec,
        log: LogSink,
    ) -> Result<StartedProcess, DriverError>;

    /// Signal the process group led by `pid`. Signalling a process that is
    /// already gone is not an error.
    fn signal(&self, pid: u32, signal: KillSignal) -> Result<(), DriverError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_folds_signals() {
        assert_eq!(ProcessExit::exited(3).exit_code(), 3);
        assert_eq!(ProcessExit::signaled(15).exit_code(), 143);
    }

    #[test]
    fn host_workdir_joins_relative_dir() {
        let mut spec = LaunchSpec::new("/tmp/merged", "ls");
        assert_eq!(spec.host_workdir(), PathBuf::from("/tmp/merged"));
        spec.workdir = PathBuf::from("src");
        assert_eq!(spec.host_workdir(), PathBuf::from("/tmp/merged/src"));
    }

    #[test]
    fn command_line_quotes_arguments() {
        let spec = LaunchSpec::new("/w", "echo").with_args(["hello world", "x"]);
        assert_eq!(spec.command_line(), "echo 'hello world' x");
    }
}
