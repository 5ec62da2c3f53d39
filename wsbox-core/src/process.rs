//! Commands run inside sandboxes.
//!
//! `exec_sync` blocks until the command exits or times out. `start_async`
//! launches a tracked process whose combined output goes to
//! `logs/<pid>.log`; a reaper task owns the child's exit notification and
//! records the exit code in the sandbox's process table. Exited records stay
//! queryable for the retention window and are purged lazily, together with
//! their logs, at the start of the next process operation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wsbox_commons::TelemetrySink;
use wsbox_commons::fs::remove_path;
use wsbox_config::{ProcessConfig, ResourceLimitsConfig};
use wsbox_runner::env::build_sandbox_env;
use wsbox_runner::{
    ExecControl, KillSignal, LaunchSpec, LogSink, LogStream, ResourceLimits, SandboxDriver,
    parse_log_line,
};

use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::files::SandboxFs;
use crate::profiles::ProfileStore;
use crate::registry::LOGS_DIR;
use crate::sandbox::{Sandbox, SandboxStatus};

const PENDING_DIR: &str = "pending";
/// How long to wait for the reaper after SIGKILL.
const REAP_WAIT: Duration = Duration::from_secs(2);

/// A command to run inside a sandbox.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub command: String,
    pub args: Vec<String>,
    /// Relative to the sandbox scope; defaults to its root.
    pub working_dir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub isolation_profile: Option<String>,
    /// Only used by [`ProcessRuntime::exec_sync`].
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub pid: Option<u32>,
    pub timed_out: bool,
    pub truncated: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Running,
    Exited,
    /// Ended after `stop_process` or a sandbox teardown.
    Killed,
}

/// Public view of a tracked process.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub sandbox_id: Uuid,
    pub command: String,
    pub args: Vec<String>,
    pub isolation_profile: String,
    pub status: ProcessState,
    pub running: bool,
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
}

/// Which part of a combined log to return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamFilter {
    Stdout,
    Stderr,
    #[default]
    Combined,
}

impl StreamFilter {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stdout" => Some(StreamFilter::Stdout),
            "stderr" => Some(StreamFilter::Stderr),
            "combined" => Some(StreamFilter::Combined),
            _ => None,
        }
    }

    fn admits(self, stream: LogStream) -> bool {
        match self {
            StreamFilter::Combined => true,
            StreamFilter::Stdout => stream == LogStream::Stdout,
            StreamFilter::Stderr => stream == LogStream::Stderr,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LogLineView {
    pub timestamp: f64,
    pub stream: &'static str,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProcessLogs {
    pub pid: u32,
    pub stream: StreamFilter,
    pub running: bool,
    pub lines: Vec<LogLineView>,
    pub content: String,
    pub total_lines: usize,
}

#[derive(Debug)]
struct TrackedProcess {
    info: ProcessInfo,
    generation: u64,
    log_path: PathBuf,
    stop_requested: bool,
    exited: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct TableInner {
    processes: BTreeMap<u32, TrackedProcess>,
    reapers: HashMap<u32, JoinHandle<()>>,
}

/// Tracked processes of one sandbox. The reaper writes exit codes under
/// the same mutex readers take.
#[derive(Debug, Default)]
struct ProcessTable {
    inner: Mutex<TableInner>,
}

pub struct ProcessRuntime {
    driver: Arc<dyn SandboxDriver>,
    profiles: Arc<ProfileStore>,
    default_profile: String,
    config: ProcessConfig,
    limits: ResourceLimits,
    sandboxes_dir: PathBuf,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySink<EngineEvent>>,
    tables: Mutex<HashMap<Uuid, Arc<ProcessTable>>>,
    pending_seq: AtomicU64,
    generation: AtomicU64,
}

/// Engine-wide limits with `0` meaning "inherit".
pub fn resource_limits(config: &ResourceLimitsConfig) -> ResourceLimits {
    let nonzero = |value: u64| (value > 0).then_some(value);
    ResourceLimits {
        cpu_time_secs: nonzero(config.cpu_time_seconds),
        wall_time: None,
        memory_bytes: nonzero(config.memory_mb).map(|mb| mb.saturating_mul(1024 * 1024)),
        open_files: nonzero(config.open_files),
        processes: nonzero(config.processes),
    }
}

impl ProcessRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        driver: Arc<dyn SandboxDriver>,
        profiles: Arc<ProfileStore>,
        default_profile: impl Into<String>,
        config: ProcessConfig,
        limits: ResourceLimits,
        sandboxes_dir: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        telemetry: Arc<dyn TelemetrySink<EngineEvent>>,
    ) -> Self {
        Self {
            driver,
            profiles,
            default_profile: default_profile.into(),
            config,
            limits,
            sandboxes_dir: sandboxes_dir.into(),
            clock,
            telemetry,
            tables: Mutex::new(HashMap::new()),
            pending_seq: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    fn logs_dir(&self, sandbox_id: Uuid) -> PathBuf {
        self.sandboxes_dir
            .join(sandbox_id.to_string())
            .join(LOGS_DIR)
    }

    fn table(&self, sandbox_id: Uuid) -> Arc<ProcessTable> {
        Arc::clone(self.tables.lock().entry(sandbox_id).or_default())
    }

    fn existing_table(&self, sandbox_id: Uuid) -> Option<Arc<ProcessTable>> {
        self.tables.lock().get(&sandbox_id).cloned()
    }

    fn emit(&self, event: EngineEvent) {
        if let Err(error) = self.telemetry.record(&event) {
            debug!(%error, "telemetry sink rejected event");
        }
    }

    fn ensure_active(sandbox: &Sandbox) -> EngineResult<()> {
        if sandbox.status == SandboxStatus::Active {
            Ok(())
        } else {
            Err(EngineError::invalid_state(format!(
                "sandbox {} is {}; processes require an active sandbox",
                sandbox.id, sandbox.status
            )))
        }
    }

    fn launch_spec(&self, sandbox: &Sandbox, request: &LaunchRequest) -> EngineResult<(LaunchSpec, String)> {
        let program = request.command.trim();
        if program.is_empty() {
            return Err(EngineError::invalid_args("command must not be empty"));
        }
        let key = request
            .isolation_profile
            .as_deref()
            .unwrap_or(&self.default_profile);
        let profile = self
            .profiles
            .get(key)
            .ok_or_else(|| EngineError::not_found(format!("isolation profile '{key}' not found")))?;

        let workdir = SandboxFs::new(sandbox)
            .resolve(request.working_dir.as_deref().unwrap_or(""), true)?;
        if !workdir.absolute.is_dir() {
            return Err(EngineError::invalid_args(format!(
                "working_dir '{}' is not a directory in the sandbox",
                workdir.relative
            )));
        }

        let mut spec = LaunchSpec::new(&sandbox.merged_dir, program).with_args(request.args.clone());
        spec.workdir = PathBuf::from(workdir.relative);
        spec.env = build_sandbox_env(
            std::env::vars(),
            &[&profile.environment, &request.env],
            &sandbox.id.to_string(),
        );
        spec.hostname = (!profile.hostname.is_empty()).then(|| profile.hostname.clone());
        spec.network = profile.network_access;
        spec.read_only_binds = profile.read_only_mounts();
        spec.read_write_binds = profile.read_write_mounts();
        spec.limits = self.limits;
        Ok((spec, profile.id.clone()))
    }

    /// Run a command to completion.
    pub async fn exec_sync(
        &self,
        sandbox: &Sandbox,
        request: &LaunchRequest,
        cancel: &CancellationToken,
    ) -> EngineResult<ExecResult> {
        Self::ensure_active(sandbox)?;
        let (spec, profile) = self.launch_spec(sandbox, request)?;
        let control = ExecControl {
            timeout: Some(request.timeout.unwrap_or_else(|| self.config.default_timeout())),
            kill_grace: self.config.kill_grace(),
            max_output_bytes: self.config.max_output_bytes,
            cancel: cancel.child_token(),
        };

        debug!(sandbox_id = %sandbox.id, command = %spec.command_line(), %profile, "exec");
        let output = self.driver.exec(&spec, &control).await?;
        if output.cancelled {
            return Err(EngineError::Cancelled);
        }
        info!(
            sandbox_id = %sandbox.id,
            exit_code = output.exit_code,
            timed_out = output.timed_out,
            duration_ms = output.duration_ms,
            "command finished"
        );
        Ok(ExecResult {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            pid: output.pid,
            timed_out: output.timed_out,
            truncated: output.truncated,
            duration_ms: output.duration_ms,
        })
    }

    async fn create_pending_log(&self, sandbox_id: Uuid) -> EngineResult<(PathBuf, tokio::fs::File)> {
        let pending_dir = self.logs_dir(sandbox_id).join(PENDING_DIR);
        tokio::fs::create_dir_all(&pending_dir)
            .await
            .map_err(|err| EngineError::io(err, "failed to create log directory"))?;
        loop {
            let n = self.pending_seq.fetch_add(1, Ordering::Relaxed);
            let path = pending_dir.join(n.to_string());
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(err) => return Err(EngineError::io(err, "failed to create pending log")),
            }
        }
    }

    /// Launch a tracked background process.
    pub async fn start_async(&self, sandbox: &Sandbox, request: &LaunchRequest) -> EngineResult<ProcessInfo> {
        Self::ensure_active(sandbox)?;
        self.collect_garbage(sandbox.id);
        let (spec, profile) = self.launch_spec(sandbox, request)?;

        let (pending, file) = self.create_pending_log(sandbox.id).await?;
        let sink = LogSink::new(file, self.config.max_log_line_bytes);
        let started = match self.driver.start_process(&spec, sink).await {
            Ok(started) => started,
            Err(error) => {
                if let Err(cleanup) = remove_path(&pending) {
                    warn!(path = %pending.display(), %cleanup, "failed to remove pending log");
                }
                return Err(error.into());
            }
        };
        let pid = started.pid;
        let log_path = self.logs_dir(sandbox.id).join(format!("{pid}.log"));
        if let Err(error) = tokio::fs::rename(&pending, &log_path).await {
            warn!(pid, %error, "failed to publish process log; killing process");
            if let Err(kill_error) = self.driver.signal(pid, KillSignal::Kill) {
                warn!(pid, %kill_error, "failed to kill unpublished process");
            }
            if let Err(cleanup) = remove_path(&pending) {
                warn!(path = %pending.display(), %cleanup, "failed to remove pending log");
            }
            return Err(EngineError::io(error, "failed to publish process log"));
        }

        let info = ProcessInfo {
            pid,
            sandbox_id: sandbox.id,
            command: spec.program.clone(),
            args: spec.args.clone(),
            isolation_profile: profile,
            status: ProcessState::Running,
            running: true,
            exit_code: None,
            signal: None,
            started_at: self.clock.now(),
            exited_at: None,
        };
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (exited, _) = watch::channel(false);
        let table = self.table(sandbox.id);
        {
            let mut inner = table.inner.lock();
            if let Some(stale) = inner.reapers.remove(&pid) {
                debug!(pid, "pid reused; replacing stale record");
                stale.abort();
            }
            let reaper = tokio::spawn(reap(
                Arc::clone(&table),
                pid,
                generation,
                started.exit,
                Arc::clone(&self.clock),
                Arc::clone(&self.telemetry),
            ));
            inner.processes.insert(
                pid,
                TrackedProcess {
                    info: info.clone(),
                    generation,
                    log_path,
                    stop_requested: false,
                    exited,
                },
            );
            inner.reapers.insert(pid, reaper);
        }

        info!(sandbox_id = %sandbox.id, pid, command = %spec.command_line(), "process started");
        self.emit(EngineEvent::ProcessStarted {
            sandbox_id: sandbox.id,
            pid,
            command: spec.command_line(),
        });
        Ok(info)
    }

    fn lookup(&self, sandbox_id: Uuid, pid: u32) -> EngineResult<(Arc<ProcessTable>, ProcessInfo)> {
        let not_found = || EngineError::not_found(format!("process {pid} not found in sandbox {sandbox_id}"));
        let table = self.existing_table(sandbox_id).ok_or_else(not_found)?;
        let info = table
            .inner
            .lock()
            .processes
            .get(&pid)
            .map(|process| process.info.clone())
            .ok_or_else(not_found)?;
        Ok((table, info))
    }

    pub fn status(&self, sandbox: &Sandbox, pid: u32) -> EngineResult<ProcessInfo> {
        Self::ensure_active(sandbox)?;
        self.collect_garbage(sandbox.id);
        self.lookup(sandbox.id, pid).map(|(_, info)| info)
    }

    pub fn list(&self, sandbox: &Sandbox) -> EngineResult<Vec<ProcessInfo>> {
        Self::ensure_active(sandbox)?;
        self.collect_garbage(sandbox.id);
        let mut processes: Vec<ProcessInfo> = self
            .existing_table(sandbox.id)
            .map(|table| {
                table
                    .inner
                    .lock()
                    .processes
                    .values()
                    .map(|process| process.info.clone())
                    .collect()
            })
            .unwrap_or_default();
        processes.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.pid.cmp(&b.pid)));
        Ok(processes)
    }

    pub fn running_count(&self, sandbox_id: Uuid) -> usize {
        self.existing_table(sandbox_id)
            .map(|table| {
                table
                    .inner
                    .lock()
                    .processes
                    .values()
                    .filter(|process| process.info.running)
                    .count()
            })
            .unwrap_or(0)
    }

    /// SIGTERM, then SIGKILL after the grace period. Stopping an exited
    /// process succeeds without sending anything.
    pub async fn kill(&self, sandbox: &Sandbox, pid: u32) -> EngineResult<ProcessInfo> {
        Self::ensure_active(sandbox)?;
        self.collect_garbage(sandbox.id);
        let (table, info) = self.lookup(sandbox.id, pid)?;
        if !info.running {
            return Ok(info);
        }
        let exited = {
            let mut inner = table.inner.lock();
            match inner.processes.get_mut(&pid) {
                Some(process) => {
                    process.stop_requested = true;
                    process.exited.subscribe()
                }
                None => return self.lookup(sandbox.id, pid).map(|(_, info)| info),
            }
        };
        self.terminate(pid, exited, self.config.kill_grace()).await?;
        self.lookup(sandbox.id, pid).map(|(_, info)| info)
    }

    async fn terminate(
        &self,
        pid: u32,
        mut exited: watch::Receiver<bool>,
        grace: Duration,
    ) -> EngineResult<()> {
        self.driver.signal(pid, KillSignal::Term)?;
        if tokio::time::timeout(grace, exited.wait_for(|done| *done))
            .await
            .is_ok()
        {
            return Ok(());
        }
        info!(pid, "process ignored SIGTERM; sending SIGKILL");
        self.driver.signal(pid, KillSignal::Kill)?;
        if tokio::time::timeout(REAP_WAIT, exited.wait_for(|done| *done))
            .await
            .is_err()
        {
            warn!(pid, "process not reaped after SIGKILL");
        }
        Ok(())
    }

    pub async fn logs(
        &self,
        sandbox: &Sandbox,
        pid: u32,
        tail_lines: Option<usize>,
        stream: StreamFilter,
    ) -> EngineResult<ProcessLogs> {
        Self::ensure_active(sandbox)?;
        self.collect_garbage(sandbox.id);
        let (table, info) = self.lookup(sandbox.id, pid)?;
        let log_path = table
            .inner
            .lock()
            .processes
            .get(&pid)
            .map(|process| process.log_path.clone())
            .ok_or_else(|| EngineError::not_found(format!("process {pid} not found")))?;

        let bytes = match tokio::fs::read(&log_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(EngineError::io(err, "failed to read process log")),
        };
        let text = String::from_utf8_lossy(&bytes);
        let selected: Vec<LogLineView> = text
            .lines()
            .map(parse_log_line)
            .filter(|line| stream.admits(line.stream))
            .map(|line| LogLineView {
                timestamp: line.timestamp,
                stream: line.stream.as_str(),
                text: line.text,
            })
            .collect();

        let total_lines = selected.len();
        let tail = tail_lines.unwrap_or(self.config.default_tail_lines);
        let lines: Vec<LogLineView> = if tail == 0 || tail >= total_lines {
            selected
        } else {
            selected.into_iter().skip(total_lines - tail).collect()
        };
        let mut content = lines
            .iter()
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if !content.is_empty() {
            content.push('\n');
        }

        Ok(ProcessLogs {
            pid,
            stream,
            running: info.running,
            lines,
            content,
            total_lines,
        })
    }

    /// Drop exited records older than the retention window, with their logs.
    pub fn collect_garbage(&self, sandbox_id: Uuid) {
        let Some(table) = self.existing_table(sandbox_id) else {
            return;
        };
        let retention = chrono::Duration::from_std(self.config.retention())
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let cutoff = self.clock.now() - retention;

        let purged: Vec<(u32, PathBuf)> = {
            let mut inner = table.inner.lock();
            let expired: Vec<u32> = inner
                .processes
                .values()
                .filter(|process| process.info.exited_at.is_some_and(|at| at <= cutoff))
                .map(|process| process.info.pid)
                .collect();
            expired
                .into_iter()
                .filter_map(|pid| {
                    inner.reapers.remove(&pid);
                    inner
                        .processes
                        .remove(&pid)
                        .map(|process| (pid, process.log_path))
                })
                .collect()
        };
        for (pid, log_path) in purged {
            remove_log(&log_path);
            debug!(sandbox_id = %sandbox_id, pid, "purged process record");
            self.emit(EngineEvent::ProcessPurged { sandbox_id, pid });
        }
    }

    /// Stop every process of a sandbox and forget all of its records and logs.
    pub async fn shutdown_sandbox(&self, sandbox_id: Uuid) -> EngineResult<usize> {
        let Some(table) = self.existing_table(sandbox_id) else {
            return Ok(0);
        };
        let running: Vec<(u32, watch::Receiver<bool>)> = {
            let mut inner = table.inner.lock();
            inner
                .processes
                .values_mut()
                .filter(|process| process.info.running)
                .map(|process| {
                    process.stop_requested = true;
                    (process.info.pid, process.exited.subscribe())
                })
                .collect()
        };

        for (pid, _) in &running {
            if let Err(error) = self.driver.signal(*pid, KillSignal::Term) {
                warn!(pid, %error, "failed to send SIGTERM");
            }
        }
        let deadline = tokio::time::Instant::now() + self.config.kill_grace();
        for (pid, mut exited) in running.iter().map(|(pid, rx)| (*pid, rx.clone())) {
            if tokio::time::timeout_at(deadline, exited.wait_for(|done| *done))
                .await
                .is_ok()
            {
                continue;
            }
            if let Err(error) = self.driver.signal(pid, KillSignal::Kill) {
                warn!(pid, %error, "failed to send SIGKILL");
            }
            if tokio::time::timeout(REAP_WAIT, exited.wait_for(|done| *done))
                .await
                .is_err()
            {
                warn!(pid, "process not reaped after SIGKILL");
            }
        }

        let purged: Vec<u32> = {
            let mut inner = table.inner.lock();
            for (_, reaper) in inner.reapers.drain() {
                reaper.abort();
            }
            std::mem::take(&mut inner.processes).into_keys().collect()
        };
        self.tables.lock().remove(&sandbox_id);
        if let Err(error) = remove_path(&self.logs_dir(sandbox_id)) {
            warn!(sandbox_id = %sandbox_id, %error, "failed to remove process logs");
        }
        for pid in &purged {
            self.emit(EngineEvent::ProcessPurged {
                sandbox_id,
                pid: *pid,
            });
        }
        info!(sandbox_id = %sandbox_id, stopped = running.len(), purged = purged.len(), "sandbox processes torn down");
        Ok(running.len())
    }

    /// Tear down every tracked process, used at engine shutdown.
    pub async fn shutdown_all(&self) {
        let ids: Vec<Uuid> = self.tables.lock().keys().copied().collect();
        for id in ids {
            if let Err(error) = self.shutdown_sandbox(id).await {
                warn!(sandbox_id = %id, %error, "failed to tear down processes");
            }
        }
    }
}

fn remove_log(path: &Path) {
    if let Err(error) = remove_path(path) {
        warn!(path = %path.display(), %error, "failed to remove process log");
    }
}

async fn reap(
    table: Arc<ProcessTable>,
    pid: u32,
    generation: u64,
    exit: tokio::sync::oneshot::Receiver<wsbox_runner::ProcessExit>,
    clock: Arc<dyn Clock>,
    telemetry: Arc<dyn TelemetrySink<EngineEvent>>,
) {
    let exit = exit.await.ok();
    let event = {
        let mut inner = table.inner.lock();
        let Some(process) = inner
            .processes
            .get_mut(&pid)
            .filter(|process| process.generation == generation)
        else {
            return;
        };
        process.info.running = false;
        process.info.exit_code = exit.map(|exit| exit.exit_code());
        process.info.signal = exit.and_then(|exit| exit.signal);
        process.info.exited_at = Some(clock.now());
        process.info.status = if process.stop_requested {
            ProcessState::Killed
        } else {
            ProcessState::Exited
        };
        process.exited.send_replace(true);
        let event = EngineEvent::ProcessExited {
            sandbox_id: process.info.sandbox_id,
            pid,
            exit_code: process.info.exit_code,
            killed: process.stop_requested,
        };
        inner.reapers.remove(&pid);
        event
    };
    info!(pid, ?event, "process exited");
    if let Err(error) = telemetry.record(&event) {
        debug!(%error, "telemetry sink rejected event");
    }
}
