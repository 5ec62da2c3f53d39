//! The tool surface.
//!
//! [`Executor::execute`] takes a tool name and a JSON argument object and
//! always answers with an [`ExecutionResult`]; failures never escape as Rust
//! errors. Internal failures are logged with their full chain, forwarded to
//! the injected [`ErrorReporter`], and replaced by a generic message.

pub mod args;
pub mod result;
pub mod tools;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, ensure};
use serde::Serialize;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wsbox_commons::{ErrorReporter, TelemetrySink, TracingErrorReporter, TracingTelemetry};
use wsbox_config::{DriverConfig, DriverKind, EngineConfig};
use wsbox_runner::{BubblewrapDriver, HostDriver, SandboxDriver};

use crate::clock::{Clock, IdSource, RandomIds, SystemClock};
use crate::diff::{ApproveRequest, DiffEngine};
use crate::error::{EngineError, EngineResult, ErrorCode};
use crate::events::EngineEvent;
use crate::files::{ListOptions, ReadOptions, SandboxFs, WriteOptions};
use crate::overlay::OverlayLayer;
use crate::process::{LaunchRequest, ProcessRuntime, StreamFilter, resource_limits};
use crate::profiles::ProfileStore;
use crate::registry::{CreateSandbox, ListFilter, SandboxRegistry};
use crate::sandbox::{Sandbox, SandboxStatus};
use crate::vcs::{GitAdapter, VcsAdapter};

use self::args::{
    ApproveArgs, CommandArgs, CreateDirectoryArgs, CreateSandboxArgs, DeleteFileArgs,
    DeleteSandboxArgs, DiscardArgs, GetDiffArgs, ListFilesArgs, ListSandboxesArgs, ProcessArgs,
    ProcessLogsArgs, ReadFileArgs, RejectArgs, SandboxArgs, WriteFileArgs, parse,
};
pub use self::result::{AsyncHandle, ExecutionResult};
pub use self::tools::{ToolName, ToolTier};

/// Owner recorded when `create_sandbox` does not name one.
pub const DEFAULT_OWNER: &str = "anonymous";

/// Everything the engine needs from the outside world.
pub struct Dependencies {
    pub config: EngineConfig,
    pub driver: Arc<dyn SandboxDriver>,
    pub vcs: Arc<dyn VcsAdapter>,
    pub profiles: Arc<ProfileStore>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdSource>,
    pub telemetry: Arc<dyn TelemetrySink<EngineEvent>>,
    pub errors: Arc<dyn ErrorReporter>,
}

impl Dependencies {
    /// Production wiring: real driver, `git`, system clock, random ids and
    /// `tracing`-backed sinks.
    pub fn from_config(config: EngineConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let profiles = ProfileStore::load(&config.profiles)?;
        ensure!(
            profiles.contains(&config.default_isolation_profile),
            "default isolation profile '{}' is not defined",
            config.default_isolation_profile
        );
        let driver = select_driver(&config.driver)?;
        let vcs = Arc::new(GitAdapter::new(&config.vcs));
        Ok(Self {
            config,
            driver,
            vcs,
            profiles: Arc::new(profiles),
            clock: Arc::new(SystemClock),
            ids: Arc::new(RandomIds),
            telemetry: Arc::new(TracingTelemetry),
            errors: Arc::new(TracingErrorReporter),
        })
    }
}

fn select_driver(config: &DriverConfig) -> anyhow::Result<Arc<dyn SandboxDriver>> {
    let locate = || {
        BubblewrapDriver::locate(config.bwrap_path.as_deref(), config.workspace_mount.as_str())
    };
    let driver: Arc<dyn SandboxDriver> = match config.kind {
        DriverKind::Host => Arc::new(HostDriver::new()),
        DriverKind::Bubblewrap => {
            Arc::new(locate().context("bubblewrap driver requested but unavailable")?)
        }
        DriverKind::Auto => match locate() {
            Ok(driver) => Arc::new(driver),
            Err(error) => {
                warn!(%error, "bubblewrap unavailable; processes run on the host driver");
                Arc::new(HostDriver::new())
            }
        },
    };
    info!(driver = driver.name(), "sandbox driver selected");
    Ok(driver)
}

fn encode<T: Serialize>(value: &T) -> EngineResult<Value> {
    serde_json::to_value(value)
        .map_err(|err| EngineError::Internal(anyhow::Error::new(err).context("failed to encode result")))
}

/// File tools need a live union view.
fn require_active(sandbox: &Sandbox) -> EngineResult<()> {
    match sandbox.status {
        SandboxStatus::Active => Ok(()),
        SandboxStatus::Approving => Err(EngineError::conflict(format!(
            "sandbox {} has an approval in progress",
            sandbox.id
        ))),
        status => Err(EngineError::invalid_state(format!(
            "sandbox {} is {status}; file operations require an active sandbox",
            sandbox.id
        ))),
    }
}

async fn blocking<T, F>(work: F) -> EngineResult<T>
where
    F: FnOnce() -> EngineResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await?
}

pub struct Executor {
    config: EngineConfig,
    profiles: Arc<ProfileStore>,
    registry: Arc<SandboxRegistry>,
    runtime: ProcessRuntime,
    diff: DiffEngine,
    errors: Arc<dyn ErrorReporter>,
}

impl Executor {
    /// Open the registry (recovering persisted sandboxes) and wire the
    /// components together.
    pub fn new(deps: Dependencies) -> EngineResult<Self> {
        let Dependencies {
            config,
            driver,
            vcs,
            profiles,
            clock,
            ids,
            telemetry,
            errors,
        } = deps;

        let registry = Arc::new(SandboxRegistry::open(
            config.sandboxes_dir(),
            OverlayLayer::new(&config.overlay),
            Arc::clone(&clock),
            ids,
            Arc::clone(&telemetry),
        )?);
        let runtime = ProcessRuntime::new(
            driver,
            Arc::clone(&profiles),
            config.default_isolation_profile.clone(),
            config.process.clone(),
            resource_limits(&config.limits),
            config.sandboxes_dir(),
            clock,
            Arc::clone(&telemetry),
        );
        let diff = DiffEngine::new(Arc::clone(&registry), vcs, telemetry);
        info!(
            engine_root = %config.engine_root.display(),
            driver = runtime.driver_name(),
            "engine ready"
        );
        Ok(Self {
            config,
            profiles,
            registry,
            runtime,
            diff,
            errors,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn profiles(&self) -> &ProfileStore {
        &self.profiles
    }

    pub fn driver_name(&self) -> &'static str {
        self.runtime.driver_name()
    }

    /// Run one tool call.
    pub async fn execute(&self, tool: &str, args: Value, cancel: &CancellationToken) -> ExecutionResult {
        let Ok(name) = tool.parse::<ToolName>() else {
            return self.failed(tool, EngineError::UnknownTool(tool.to_string()));
        };
        if cancel.is_cancelled() {
            return self.failed(tool, EngineError::Cancelled);
        }

        let started = Instant::now();
        debug!(tool, "dispatching tool call");
        let outcome = match name.tier() {
            ToolTier::Lifecycle => self.lifecycle(name, args).await,
            ToolTier::Exec => self.exec(name, args, cancel).await,
            ToolTier::Files => self.files(name, args).await,
            ToolTier::Diff => self.review(name, args, cancel).await,
        };
        match outcome {
            Ok(result) => {
                debug!(
                    tool,
                    success = result.success,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tool call finished"
                );
                result
            }
            Err(error) => self.failed(tool, error),
        }
    }

    /// Stop every tracked process. Sandboxes themselves persist.
    pub async fn shutdown(&self) {
        self.runtime.shutdown_all().await;
        info!("engine shut down");
    }

    fn failed(&self, tool: &str, error: EngineError) -> ExecutionResult {
        match &error {
            EngineError::Internal(inner) => {
                error!(tool, error = ?inner, "tool call failed with an internal error");
                if let Err(report_error) = self.errors.capture(inner) {
                    debug!(error = %report_error, "error reporter rejected capture");
                }
            }
            EngineError::Cancelled => info!(tool, "tool call cancelled"),
            other if other.code().is_caller_fixable() => {
                debug!(tool, code = %other.code(), error = %other, "tool call rejected");
            }
            other => warn!(tool, code = %other.code(), error = %other, "tool call failed"),
        }
        ExecutionResult::failure(&error)
    }

    async fn lifecycle(&self, tool: ToolName, args: Value) -> EngineResult<ExecutionResult> {
        match tool {
            ToolName::CreateSandbox => {
                let args: CreateSandboxArgs = parse(tool, args)?;
                let project_root = match args.project_root {
                    Some(root) => root,
                    None => std::env::current_dir()
                        .map_err(|err| EngineError::io(err, "failed to read working directory"))?,
                };
                let owner = args
                    .owner
                    .filter(|owner| !owner.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_OWNER.to_string());
                let sandbox = self
                    .registry
                    .create(CreateSandbox {
                        scope_path: args.scope_path,
                        project_root,
                        owner,
                        owner_type: args.owner_type,
                        no_lock: args.no_lock,
                        metadata: args.metadata.unwrap_or_default(),
                    })
                    .await?;
                Ok(ExecutionResult::ok(encode(&sandbox)?))
            }
            ToolName::GetSandbox => {
                let args: SandboxArgs = parse(tool, args)?;
                let sandbox = self.registry.get(args.sandbox_id)?;
                let mut data = encode(&sandbox)?;
                if let Some(fields) = data.as_object_mut() {
                    fields.insert(
                        "running_processes".to_string(),
                        json!(self.runtime.running_count(sandbox.id)),
                    );
                }
                Ok(ExecutionResult::ok(data))
            }
            ToolName::ListSandboxes => {
                let args: ListSandboxesArgs = parse(tool, args)?;
                let page = self.registry.list(&ListFilter {
                    owner: args.owner,
                    project_root: args.project_root,
                    status: args.status,
                    limit: args.limit,
                    offset: args.offset.unwrap_or(0),
                });
                Ok(ExecutionResult::ok(encode(&page)?))
            }
            ToolName::DeleteSandbox => {
                let args: DeleteSandboxArgs = parse(tool, args)?;
                let guard = self.registry.lock(args.sandbox_id).await?;
                let running = self.runtime.running_count(guard.id());
                if running > 0 && !args.force {
                    return Err(EngineError::conflict(format!(
                        "sandbox {} has {running} running process(es); pass force=true to stop them",
                        guard.id()
                    )));
                }
                let stopped = self.runtime.shutdown_sandbox(guard.id()).await?;
                let deleted = self.registry.delete(&guard).await?;
                info!(sandbox_id = %deleted.id, processes_stopped = stopped, "sandbox deleted");
                Ok(ExecutionResult::ok(json!({
                    "sandbox_id": deleted.id,
                    "status": deleted.status,
                    "processes_stopped": stopped,
                })))
            }
            ToolName::StartSandbox => {
                let args: SandboxArgs = parse(tool, args)?;
                let guard = self.registry.lock(args.sandbox_id).await?;
                let sandbox = self.registry.start(&guard).await?;
                Ok(ExecutionResult::ok(encode(&sandbox)?))
            }
            ToolName::StopSandbox => {
                let args: SandboxArgs = parse(tool, args)?;
                let guard = self.registry.lock(args.sandbox_id).await?;
                let current = guard.snapshot();
                if current.status != SandboxStatus::Active {
                    return Err(EngineError::invalid_state(format!(
                        "sandbox {} is {}; only an active sandbox can be stopped",
                        current.id, current.status
                    )));
                }
                let stopped = self.runtime.shutdown_sandbox(current.id).await?;
                let sandbox = self.registry.stop(&guard).await?;
                info!(sandbox_id = %sandbox.id, processes_stopped = stopped, "sandbox stopped");
                Ok(ExecutionResult::ok(encode(&sandbox)?))
            }
            other => Err(EngineError::Internal(anyhow::anyhow!(
                "{other} routed to the lifecycle tier"
            ))),
        }
    }

    async fn exec(
        &self,
        tool: ToolName,
        args: Value,
        cancel: &CancellationToken,
    ) -> EngineResult<ExecutionResult> {
        match tool {
            ToolName::ExecuteCommand | ToolName::StartProcess => {
                let args: CommandArgs = parse(tool, args)?;
                let sandbox = self.registry.get(args.sandbox_id)?;
                let request = LaunchRequest {
                    command: args.command,
                    args: args.args,
                    working_dir: args.working_dir,
                    env: args.env,
                    isolation_profile: args.isolation_profile,
                    timeout: args.timeout_sec,
                };
                if tool == ToolName::ExecuteCommand {
                    let output = self.runtime.exec_sync(&sandbox, &request, cancel).await?;
                    return Ok(ExecutionResult::ok(encode(&output)?));
                }
                if request.timeout.is_some() {
                    debug!(sandbox_id = %sandbox.id, "start_process ignores timeout_sec");
                }
                let info = self.runtime.start_async(&sandbox, &request).await?;
                let handle = AsyncHandle {
                    sandbox_id: sandbox.id,
                    pid: info.pid,
                };
                Ok(ExecutionResult::ok(encode(&info)?).with_handle(handle))
            }
            ToolName::GetProcessStatus => {
                let args: ProcessArgs = parse(tool, args)?;
                let sandbox = self.registry.get(args.sandbox_id)?;
                let info = self.runtime.status(&sandbox, args.pid)?;
                Ok(ExecutionResult::ok(encode(&info)?))
            }
            ToolName::ListProcesses => {
                let args: SandboxArgs = parse(tool, args)?;
                let sandbox = self.registry.get(args.sandbox_id)?;
                let processes = self.runtime.list(&sandbox)?;
                Ok(ExecutionResult::ok(json!({
                    "sandbox_id": sandbox.id,
                    "count": processes.len(),
                    "processes": encode(&processes)?,
                })))
            }
            ToolName::StopProcess => {
                let args: ProcessArgs = parse(tool, args)?;
                let sandbox = self.registry.get(args.sandbox_id)?;
                let info = self.runtime.kill(&sandbox, args.pid).await?;
                Ok(ExecutionResult::ok(encode(&info)?))
            }
            ToolName::GetProcessLogs => {
                let args: ProcessLogsArgs = parse(tool, args)?;
                let stream = match args.stream.as_deref() {
                    None => StreamFilter::default(),
                    Some(raw) => StreamFilter::parse(raw).ok_or_else(|| {
                        EngineError::invalid_args(format!(
                            "stream must be stdout, stderr or combined, got '{raw}'"
                        ))
                    })?,
                };
                let sandbox = self.registry.get(args.sandbox_id)?;
                let logs = self
                    .runtime
                    .logs(&sandbox, args.pid, args.tail_lines, stream)
                    .await?;
                Ok(ExecutionResult::ok(encode(&logs)?))
            }
            other => Err(EngineError::Internal(anyhow::anyhow!(
                "{other} routed to the exec tier"
            ))),
        }
    }

    fn active_fs(&self, id: Uuid) -> EngineResult<SandboxFs> {
        let sandbox = self.registry.get(id)?;
        require_active(&sandbox)?;
        Ok(SandboxFs::new(&sandbox))
    }

    async fn files(&self, tool: ToolName, args: Value) -> EngineResult<ExecutionResult> {
        let data = match tool {
            ToolName::ListFiles => {
                let args: ListFilesArgs = parse(tool, args)?;
                let fs = self.active_fs(args.sandbox_id)?;
                let options = ListOptions {
                    recursive: args.recursive,
                    include_hidden: args.include_hidden,
                    pattern: args.pattern,
                };
                let listing = blocking(move || fs.list(&args.path, &options)).await?;
                encode(&listing)?
            }
            ToolName::ReadFile => {
                let args: ReadFileArgs = parse(tool, args)?;
                let fs = self.active_fs(args.sandbox_id)?;
                let options = ReadOptions {
                    encoding: args.encoding,
                    start_line: args.start_line,
                    end_line: args.end_line,
                };
                let content = blocking(move || fs.read(&args.path, &options)).await?;
                encode(&content)?
            }
            ToolName::WriteFile => {
                let args: WriteFileArgs = parse(tool, args)?;
                let fs = self.active_fs(args.sandbox_id)?;
                let defaults = WriteOptions::default();
                let options = WriteOptions {
                    encoding: args.encoding.unwrap_or(defaults.encoding),
                    create_dirs: args.create_dirs,
                    mode: args.mode,
                };
                let outcome = blocking(move || fs.write(&args.path, &args.content, &options)).await?;
                encode(&outcome)?
            }
            ToolName::DeleteFile => {
                let args: DeleteFileArgs = parse(tool, args)?;
                let fs = self.active_fs(args.sandbox_id)?;
                let outcome = blocking(move || fs.delete(&args.path, args.recursive)).await?;
                encode(&outcome)?
            }
            ToolName::CreateDirectory => {
                let args: CreateDirectoryArgs = parse(tool, args)?;
                let fs = self.active_fs(args.sandbox_id)?;
                let outcome =
                    blocking(move || fs.create_dir(&args.path, args.parents, args.mode)).await?;
                encode(&outcome)?
            }
            other => {
                return Err(EngineError::Internal(anyhow::anyhow!(
                    "{other} routed to the files tier"
                )));
            }
        };
        Ok(ExecutionResult::ok(data))
    }

    async fn review(
        &self,
        tool: ToolName,
        args: Value,
        cancel: &CancellationToken,
    ) -> EngineResult<ExecutionResult> {
        match tool {
            ToolName::GetDiff => {
                let args: GetDiffArgs = parse(tool, args)?;
                let report = self.diff.diff(args.sandbox_id, args.include_diff).await?;
                Ok(ExecutionResult::ok(encode(&report)?))
            }
            ToolName::ApproveChanges => {
                let args: ApproveArgs = parse(tool, args)?;
                let files = args.selection()?;
                let request = ApproveRequest {
                    commit_message: args.commit_message,
                    actor: args.actor,
                    files,
                };
                let report = self.diff.approve(args.sandbox_id, request, cancel).await?;
                let data = encode(&report)?;
                if report.success {
                    return Ok(ExecutionResult::ok(data));
                }
                let code = report.error_code.unwrap_or(ErrorCode::InternalError);
                let message = report
                    .error
                    .unwrap_or_else(|| "approval failed; host tree restored".to_string());
                warn!(sandbox_id = %args.sandbox_id, %code, error = %message, "approval rolled back");
                Ok(ExecutionResult::partial(data, message, code))
            }
            ToolName::RejectChanges => {
                let args: RejectArgs = parse(tool, args)?;
                let report = self
                    .diff
                    .reject(args.sandbox_id, args.actor.as_deref())
                    .await?;
                Ok(ExecutionResult::ok(encode(&report)?))
            }
            ToolName::DiscardFiles => {
                let args: DiscardArgs = parse(tool, args)?;
                let report = self
                    .diff
                    .discard(args.sandbox_id, &args.files, args.actor.as_deref())
                    .await?;
                Ok(ExecutionResult::ok(encode(&report)?))
            }
            other => Err(EngineError::Internal(anyhow::anyhow!(
                "{other} routed to the diff tier"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SequentialIds;
    use crate::vcs::CommitRequest;
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::fs;
    use std::path::{Path, PathBuf};
    use wsbox_commons::{MemoryErrorReporter, MemoryTelemetry};
    use wsbox_config::OverlayMode;
    use wsbox_runner::{CannedProcess, ExecOutput, FIRST_FAKE_PID, LogStream, RecordingDriver};

    #[derive(Default)]
    struct CountingVcs {
        commits: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl VcsAdapter for CountingVcs {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn is_tracked(&self, _root: &Path) -> Result<bool> {
            Ok(true)
        }

        async fn stage(&self, _root: &Path, _paths: &[String]) -> Result<()> {
            Ok(())
        }

        async fn commit(
            &self,
            _root: &Path,
            paths: &[String],
            _request: &CommitRequest,
        ) -> Result<Option<String>> {
            self.commits.lock().push(paths.to_vec());
            Ok(Some("c0ffee".to_string()))
        }

        async fn rollback(&self, _root: &Path, _paths: &[String]) -> Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        project: PathBuf,
        driver: Arc<RecordingDriver>,
        vcs: Arc<CountingVcs>,
        errors: Arc<MemoryErrorReporter>,
        executor: Executor,
    }

    fn fixture() -> Result<Fixture> {
        let temp = tempfile::tempdir()?;
        let project = temp.path().join("project");
        fs::create_dir_all(project.join("src"))?;
        fs::write(project.join("src/lib.rs"), "pub fn answer() -> u32 { 41 }\n")?;

        let mut config = EngineConfig::with_root(temp.path().join("engine"));
        config.overlay.mode = OverlayMode::Copy;
        config.process.kill_grace_seconds = 0;
        let driver = Arc::new(RecordingDriver::new());
        let vcs = Arc::new(CountingVcs::default());
        let errors = Arc::new(MemoryErrorReporter::new());
        let profiles = Arc::new(ProfileStore::load_with(&[], &|_| true)?);
        let executor = Executor::new(Dependencies {
            config,
            driver: driver.clone(),
            vcs: vcs.clone(),
            profiles,
            clock: Arc::new(SystemClock),
            ids: Arc::new(SequentialIds::new()),
            telemetry: Arc::new(MemoryTelemetry::<EngineEvent>::new()),
            errors: errors.clone(),
        })?;
        Ok(Fixture {
            _temp: temp,
            project,
            driver,
            vcs,
            errors,
            executor,
        })
    }

    impl Fixture {
        async fn call(&self, tool: &str, args: Value) -> ExecutionResult {
            self.executor
                .execute(tool, args, &CancellationToken::new())
                .await
        }

        async fn create(&self, scope: &str) -> Result<String> {
            let result = self
                .call(
                    "create_sandbox",
                    json!({"scope_path": scope, "project_root": self.project, "owner": "agent-1"}),
                )
                .await;
            assert!(result.success, "{result:?}");
            let id = result
                .data
                .as_ref()
                .and_then(|data| data["id"].as_str())
                .map(str::to_string);
            id.ok_or_else(|| anyhow::anyhow!("create_sandbox returned no id"))
        }
    }

    #[tokio::test]
    async fn unknown_tools_and_bad_args_are_classified() -> Result<()> {
        let fx = fixture()?;
        let result = fx.call("format_disk", json!({})).await;
        assert_eq!(result.code(), Some(ErrorCode::UnknownTool));

        let result = fx.call("get_sandbox", json!({})).await;
        assert_eq!(result.code(), Some(ErrorCode::InvalidArgs));

        let result = fx
            .call("get_sandbox", json!({"sandbox_id": Uuid::nil()}))
            .await;
        assert_eq!(result.code(), Some(ErrorCode::NotFound));
        Ok(())
    }

    #[tokio::test]
    async fn file_tools_edit_the_sandbox_only() -> Result<()> {
        let fx = fixture()?;
        let id = fx.create("src").await?;

        let write = fx
            .call(
                "write_file",
                json!({"sandbox_id": id, "path": "lib.rs", "content": "pub fn answer() -> u32 { 42 }\n"}),
            )
            .await;
        assert!(write.success, "{write:?}");
        let read = fx
            .call("read_file", json!({"sandbox_id": id, "path": "src/lib.rs"}))
            .await;
        let content = read.data.as_ref().map(|data| data["content"].clone());
        assert_eq!(content, Some(json!("pub fn answer() -> u32 { 42 }\n")));
        assert_eq!(
            fs::read_to_string(fx.project.join("src/lib.rs"))?,
            "pub fn answer() -> u32 { 41 }\n"
        );

        let escape = fx
            .call("read_file", json!({"sandbox_id": id, "path": "../../etc/passwd"}))
            .await;
        assert_eq!(escape.code(), Some(ErrorCode::PathEscape));
        Ok(())
    }

    #[tokio::test]
    async fn stopped_sandboxes_reject_file_and_process_tools() -> Result<()> {
        let fx = fixture()?;
        let id = fx.create("src").await?;
        assert!(fx.call("stop_sandbox", json!({"sandbox_id": id})).await.success);

        let listing = fx.call("list_files", json!({"sandbox_id": id})).await;
        assert_eq!(listing.code(), Some(ErrorCode::InvalidState));
        let exec = fx
            .call("execute_command", json!({"sandbox_id": id, "command": "true"}))
            .await;
        assert_eq!(exec.code(), Some(ErrorCode::InvalidState));
        let again = fx.call("stop_sandbox", json!({"sandbox_id": id})).await;
        assert_eq!(again.code(), Some(ErrorCode::InvalidState));

        let started = fx.call("start_sandbox", json!({"sandbox_id": id})).await;
        assert_eq!(
            started.data.as_ref().map(|data| data["status"].clone()),
            Some(json!("active"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn execute_command_returns_output() -> Result<()> {
        let fx = fixture()?;
        let id = fx.create("src").await?;
        fx.driver.push_exec_result(ExecOutput {
            exit_code: 0,
            stdout: "hi\n".to_string(),
            pid: Some(4242),
            ..ExecOutput::default()
        });
        let result = fx
            .call(
                "execute_command",
                json!({"sandbox_id": id, "command": "bash", "args": ["-c", "echo hi"], "timeout_sec": 5}),
            )
            .await;
        let data = result.data.unwrap_or_default();
        assert_eq!(data["stdout"], json!("hi\n"));
        assert_eq!(data["pid"], json!(4242));
        assert_eq!(data["timed_out"], json!(false));
        Ok(())
    }

    #[tokio::test]
    async fn start_process_hands_back_a_handle() -> Result<()> {
        let fx = fixture()?;
        let id = fx.create("src").await?;
        fx.driver
            .push_process(CannedProcess::running().with_line(LogStream::Stdout, "listening"));

        let started = fx
            .call("start_process", json!({"sandbox_id": id, "command": "server"}))
            .await;
        let handle = started.async_handle.clone();
        assert_eq!(handle.map(|handle| handle.pid), Some(FIRST_FAKE_PID));

        let listed = fx.call("list_processes", json!({"sandbox_id": id})).await;
        assert_eq!(listed.data.as_ref().map(|data| data["count"].clone()), Some(json!(1)));

        let deleted = fx.call("delete_sandbox", json!({"sandbox_id": id})).await;
        assert_eq!(deleted.code(), Some(ErrorCode::Conflict));

        let forced = fx
            .call("delete_sandbox", json!({"sandbox_id": id, "force": true}))
            .await;
        assert!(forced.success, "{forced:?}");
        assert_eq!(
            forced.data.as_ref().map(|data| data["processes_stopped"].clone()),
            Some(json!(1))
        );
        assert!(fx.driver.running_pids().is_empty());
        let gone = fx.call("get_sandbox", json!({"sandbox_id": id})).await;
        assert_eq!(gone.code(), Some(ErrorCode::NotFound));
        Ok(())
    }

    #[tokio::test]
    async fn logs_reject_unknown_streams() -> Result<()> {
        let fx = fixture()?;
        let id = fx.create("src").await?;
        let result = fx
            .call(
                "get_process_logs",
                json!({"sandbox_id": id, "pid": 1, "stream": "stdin"}),
            )
            .await;
        assert_eq!(result.code(), Some(ErrorCode::InvalidArgs));
        Ok(())
    }

    #[tokio::test]
    async fn approve_commits_through_the_adapter() -> Result<()> {
        let fx = fixture()?;
        let id = fx.create("src").await?;
        let write = fx
            .call(
                "write_file",
                json!({"sandbox_id": id, "path": "new.txt", "content": "fresh\n"}),
            )
            .await;
        assert!(write.success);

        let diff = fx.call("get_diff", json!({"sandbox_id": id})).await;
        let total = diff.data.as_ref().map(|data| data["summary"]["total"].clone());
        assert_eq!(total, Some(json!(1)));

        let approved = fx
            .call(
                "approve_changes",
                json!({"sandbox_id": id, "commit_message": "add new.txt"}),
            )
            .await;
        assert!(approved.success, "{approved:?}");
        assert_eq!(fs::read_to_string(fx.project.join("src/new.txt"))?, "fresh\n");
        assert_eq!(fx.vcs.commits.lock().clone(), vec![vec!["new.txt".to_string()]]);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_calls_do_not_run() -> Result<()> {
        let fx = fixture()?;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = fx
            .executor
            .execute("list_sandboxes", json!({}), &cancel)
            .await;
        assert_eq!(result.code(), Some(ErrorCode::InternalError));
        assert_eq!(result.error.as_deref(), Some("operation cancelled"));
        assert!(fx.errors.messages().is_empty());
        Ok(())
    }
}
