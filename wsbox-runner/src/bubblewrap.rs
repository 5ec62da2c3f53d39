//! Driver that isolates commands with bubblewrap (`bwrap`).
//!
//! The sandbox's merged directory is bound read-write at the workspace mount
//! point, profile binds are layered on top, and PID/IPC/UTS namespaces are
//! always unshared. The network namespace is unshared unless the profile
//! allows network access.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

use crate::driver::{
    BindMount, DriverError, ExecControl, ExecOutput, LaunchSpec, SandboxDriver, StartedProcess,
    ensure_workdir,
};
use crate::log::LogSink;
use crate::pipe;
use crate::process_group::{self, KillSignal};

pub const BWRAP_PROGRAM: &str = "bwrap";

#[derive(Debug, Clone)]
pub struct BubblewrapDriver {
    bwrap: PathBuf,
    workspace_mount: PathBuf,
}

impl BubblewrapDriver {
    pub fn new(bwrap: impl Into<PathBuf>, workspace_mount: impl Into<PathBuf>) -> Self {
        Self {
            bwrap: bwrap.into(),
            workspace_mount: workspace_mount.into(),
        }
    }

    /// Find `bwrap`, either at `explicit` or on `PATH`.
    pub fn locate(
        explicit: Option<&Path>,
        workspace_mount: impl Into<PathBuf>,
    ) -> Result<Self, DriverError> {
        let bwrap = match explicit {
            Some(path) if path.is_file() => path.to_path_buf(),
            Some(path) => {
                return Err(DriverError::Unavailable(format!(
                    "bwrap not found at {}",
                    path.display()
                )));
            }
            None => which::which(BWRAP_PROGRAM)
                .map_err(|err| DriverError::Unavailable(format!("bwrap not on PATH: {err}")))?,
        };
        Ok(Self::new(bwrap, workspace_mount))
    }

    pub fn bwrap_path(&self) -> &Path {
        &self.bwrap
    }

    pub fn workspace_mount(&self) -> &Path {
        &self.workspace_mount
    }

    /// Arguments passed to `bwrap` for `spec`.
    pub fn build_args(&self, spec: &LaunchSpec) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "--die-with-parent",
            "--new-session",
            "--unshare-pid",
            "--unshare-ipc",
            "--unshare-uts",
            "--unshare-cgroup-try",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        if !spec.network {
            args.push("--unshare-net".into());
        }
        if let Some(hostname) = &spec.hostname {
            args.push("--hostname".into());
            args.push(hostname.into());
        }

        push_binds(&mut args, "--ro-bind", &spec.read_only_binds);
        push_binds(&mut args, "--bind", &spec.read_write_binds);

        args.push("--bind".into());
        args.push(spec.root.clone().into_os_string());
        args.push(self.workspace_mount.clone().into_os_string());

        for flag in [["--proc", "/proc"], ["--dev", "/dev"], ["--tmpfs", "/tmp"]] {
            args.extend(flag.iter().map(OsString::from));
        }

        args.push("--chdir".into());
        args.push(self.workspace_mount.join(&spec.workdir).into_os_string());

        // Environment is cleared by the outer command; bwrap passes its own
        // environment through to the child.
        args.push("--".into());
        args.push(spec.program.clone().into());
        args.extend(spec.args.iter().map(OsString::from));
        args
    }

    fn command(&self, spec: &LaunchSpec) -> Result<Command, DriverError> {
        ensure_workdir(spec)?;
        let mut command = Command::new(&self.bwrap);
        command
            .args(self.build_args(spec))
            .current_dir(&spec.root)
            .env_clear()
            .envs(&spec.env);
        pipe::harden(&mut command, spec.limits);
        Ok(command)
    }
}

fn push_binds(args: &mut Vec<OsString>, flag: &str, binds: &[BindMount]) {
    for bind in binds {
        args.push(flag.into());
        args.push(bind.host.clone().into_os_string());
        args.push(bind.target.clone().into_os_string());
    }
}

#[async_trait]
impl SandboxDriver for BubblewrapDriver {
    fn name(&self) -> &'static str {
        "bubblewrap"
    }

    async fn exec(
        &self,
        spec: &LaunchSpec,
        control: &ExecControl,
    ) -> Result<ExecOutput, DriverError> {
        let command = self.command(spec)?;
        let control = ExecControl {
            timeout: spec.limits.effective_timeout(control.timeout),
            ..control.clone()
        };
        pipe::run_to_completion(command, &spec.program, &control).await
    }

    async fn start_process(
        &self,
        spec: &LaunchSpec,
        log: LogSink,
    ) -> Result<StartedProcess, DriverError> {
        let command = self.command(spec)?;
        pipe::spawn_logged(command, &spec.program, log)
    }

    fn signal(&self, pid: u32, signal: KillSignal) -> Result<(), DriverError> {
        process_group::signal_group(pid, signal)
            .map(|_| ())
            .map_err(|source| DriverError::Signal { pid, source })
    }
}
