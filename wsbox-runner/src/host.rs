//! Driver that runs commands directly on the host.
//!
//! No namespaces are created: the command only gets a sanitized
//! environment, its own process group, rlimits, and the sandbox's merged
//! directory as working directory. Bind mounts and network isolation are not
//! enforced.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::driver::{
    DriverError, ExecControl, ExecOutput, LaunchSpec, SandboxDriver, StartedProcess,
    ensure_workdir,
};
use crate::log::LogSink;
use crate::pipe;
use crate::process_group::{self, KillSignal};

#[derive(Debug, Clone, Copy, Default)]
pub struct HostDriver;

impl HostDriver {
    pub fn new() -> Self {
        Self
    }

    fn command(&self, spec: &LaunchSpec) -> Result<Command, DriverError> {
        let workdir = ensure_workdir(spec)?;
        if !spec.network || !spec.read_only_binds.is_empty() || !spec.read_write_binds.is_empty() {
            debug!(
                command = %spec.command_line(),
                "host driver does not enforce binds or network isolation"
            );
        }
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(workdir)
            .env_clear()
            .envs(&spec.env);
        pipe::harden(&mut command, spec.limits);
        Ok(command)
    }
}

#[async_trait]
impl SandboxDriver for HostDriver {
    fn name(&self) -> &'static str {
        "host"
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
