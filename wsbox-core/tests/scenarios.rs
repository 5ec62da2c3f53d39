//! End-to-end tool scenarios against real processes, a copy-mode overlay and
//! a throwaway git repository.

#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;
use wsbox_commons::{MemoryErrorReporter, MemoryTelemetry};
use wsbox_config::{EngineConfig, OverlayMode};
use wsbox_core::profiles::ProfileStore;
use wsbox_core::vcs::GitAdapter;
use wsbox_core::{
    Dependencies, EngineEvent, ErrorCode, ExecutionResult, Executor, RandomIds, SystemClock,
};
use wsbox_runner::HostDriver;

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn git(root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .current_dir(root)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .env("GIT_AUTHOR_NAME", "fixture")
        .env("GIT_AUTHOR_EMAIL", "fixture@example.com")
        .env("GIT_COMMITTER_NAME", "fixture")
        .env("GIT_COMMITTER_EMAIL", "fixture@example.com")
        .args(["-c", "commit.gpgsign=false"])
        .args(args)
        .output()?;
    if !output.status.success() {
        bail!(
            "git {args:?}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// SHA-256 over every path and file body below `root`, in walk order.
fn tree_hash(root: &Path) -> Result<String> {
    let mut hasher = Sha256::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        let rel = entry.path().strip_prefix(root)?;
        hasher.update(rel.to_string_lossy().as_bytes());
        if entry.file_type().is_file() {
            hasher.update(fs::read(entry.path())?);
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

struct Engine {
    _temp: tempfile::TempDir,
    project: PathBuf,
    executor: Executor,
}

impl Engine {
    fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let project = temp.path().join("project");
        fs::create_dir_all(project.join("src/util"))?;
        fs::write(project.join("README.md"), "demo\n")?;
        fs::write(project.join("src/main.rs"), "fn main() {}\n")?;
        fs::write(project.join("src/util/mod.rs"), "pub fn noop() {}\n")?;
        git(&project, &["init", "-q"])?;
        git(&project, &["add", "."])?;
        git(&project, &["commit", "-q", "-m", "init"])?;

        let mut config = EngineConfig::with_root(temp.path().join("engine"));
        config.overlay.mode = OverlayMode::Copy;
        config.process.kill_grace_seconds = 1;
        let vcs = Arc::new(GitAdapter::new(&config.vcs));
        let profiles = Arc::new(ProfileStore::load(&config.profiles)?);
        let executor = Executor::new(Dependencies {
            config,
            driver: Arc::new(HostDriver::new()),
            vcs,
            profiles,
            clock: Arc::new(SystemClock),
            ids: Arc::new(RandomIds),
            telemetry: Arc::new(MemoryTelemetry::<EngineEvent>::new()),
            errors: Arc::new(MemoryErrorReporter::new()),
        })?;
        Ok(Self {
            _temp: temp,
            project,
            executor,
        })
    }

    async fn call(&self, tool: &str, args: Value) -> ExecutionResult {
        self.executor
            .execute(tool, args, &CancellationToken::new())
            .await
    }

    /// Call a tool that must succeed and return its data.
    async fn ok(&self, tool: &str, args: Value) -> Result<Value> {
        let result = self.call(tool, args).await;
        if !result.success {
            bail!("{tool} failed: {result:?}");
        }
        result.data.ok_or_else(|| anyhow!("{tool} returned no data"))
    }

    async fn create(&self) -> Result<String> {
        let data = self
            .ok(
                "create_sandbox",
                json!({"scope_path": "src", "project_root": self.project, "owner": "a1"}),
            )
            .await?;
        assert_eq!(data["status"], json!("active"));
        data["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("sandbox id missing"))
    }
}

fn changed_paths(diff: &Value) -> Vec<(String, String)> {
    diff["changes"]
        .as_array()
        .map(|changes| {
            changes
                .iter()
                .map(|change| {
                    (
                        change["path"].as_str().unwrap_or_default().to_string(),
                        change["kind"].as_str().unwrap_or_default().to_string(),
                    )
                })
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test]
async fn happy_path_promotes_one_commit() -> Result<()> {
    if !git_available() {
        eprintln!("git not available; skipping");
        return Ok(());
    }
    let engine = Engine::new()?;
    let id = engine.create().await?;

    engine
        .ok(
            "write_file",
            json!({"sandbox_id": id, "path": "src/new.txt", "content": "hello", "encoding": "utf-8"}),
        )
        .await?;
    let diff = engine.ok("get_diff", json!({"sandbox_id": id})).await?;
    assert_eq!(
        changed_paths(&diff),
        vec![("new.txt".to_string(), "added".to_string())]
    );
    assert_eq!(diff["changes"][0]["size"], json!(5));

    let approved = engine
        .ok(
            "approve_changes",
            json!({"sandbox_id": id, "commit_message": "add new", "actor": "a1"}),
        )
        .await?;
    assert_eq!(approved["applied"], json!(1));
    assert_eq!(approved["remaining"], json!(0));
    let hash = approved["commit_hash"].as_str().unwrap_or_default().to_string();
    assert!(hash.len() >= 7 && hash.chars().all(|c| c.is_ascii_hexdigit()));

    assert_eq!(fs::read_to_string(engine.project.join("src/new.txt"))?, "hello");
    assert_eq!(git(&engine.project, &["log", "-1", "--format=%s"])?, "add new");
    assert_eq!(git(&engine.project, &["rev-parse", "HEAD"])?, hash);
    assert_eq!(git(&engine.project, &["status", "--porcelain"])?, "");

    let diff = engine.ok("get_diff", json!({"sandbox_id": id})).await?;
    assert!(changed_paths(&diff).is_empty());
    engine.ok("delete_sandbox", json!({"sandbox_id": id})).await?;
    Ok(())
}

#[tokio::test]
async fn paths_cannot_escape_the_sandbox() -> Result<()> {
    if !git_available() {
        return Ok(());
    }
    let engine = Engine::new()?;
    let id = engine.create().await?;
    let result = engine
        .call("read_file", json!({"sandbox_id": id, "path": "../../etc/passwd"}))
        .await;
    assert!(!result.success);
    assert_eq!(result.code(), Some(ErrorCode::PathEscape));
    Ok(())
}

#[tokio::test]
async fn partial_approval_leaves_the_rest() -> Result<()> {
    if !git_available() {
        return Ok(());
    }
    let engine = Engine::new()?;
    let id = engine.create().await?;
    for (path, content) in [("a.txt", "A"), ("b.txt", "B")] {
        engine
            .ok(
                "write_file",
                json!({"sandbox_id": id, "path": path, "content": content}),
            )
            .await?;
    }

    let approved = engine
        .ok(
            "approve_changes",
            json!({"sandbox_id": id, "commit_message": "first", "actor": "u", "files": ["a.txt"]}),
        )
        .await?;
    assert_eq!(approved["applied"], json!(1));
    assert_eq!(approved["remaining"], json!(1));

    let diff = engine.ok("get_diff", json!({"sandbox_id": id})).await?;
    assert_eq!(
        changed_paths(&diff),
        vec![("b.txt".to_string(), "added".to_string())]
    );
    assert!(engine.project.join("src/a.txt").exists());
    assert!(!engine.project.join("src/b.txt").exists());
    Ok(())
}

#[tokio::test]
async fn ignored_files_are_promoted_but_not_committed() -> Result<()> {
    if !git_available() {
        return Ok(());
    }
    let engine = Engine::new()?;
    fs::write(engine.project.join(".gitignore"), "*.log\n")?;
    git(&engine.project, &["add", ".gitignore"])?;
    git(&engine.project, &["commit", "-q", "-m", "ignore logs"])?;
    let id = engine.create().await?;
    for (path, content) in [("a.txt", "A"), ("x.log", "noise")] {
        engine
            .ok(
                "write_file",
                json!({"sandbox_id": id, "path": path, "content": content}),
            )
            .await?;
    }

    let approved = engine
        .ok(
            "approve_changes",
            json!({"sandbox_id": id, "commit_message": "with log", "actor": "u"}),
        )
        .await?;
    assert_eq!(approved["success"], json!(true));
    assert_eq!(approved["applied"], json!(2));
    assert!(approved["commit_hash"].is_string());

    assert_eq!(
        git(&engine.project, &["show", "--name-only", "--format=", "HEAD"])?,
        "src/a.txt"
    );
    assert_eq!(fs::read_to_string(engine.project.join("src/x.log"))?, "noise");
    assert_eq!(git(&engine.project, &["ls-files", "--", "src/x.log"])?, "");
    Ok(())
}

#[tokio::test]
async fn timeouts_kill_the_command() -> Result<()> {
    if !git_available() {
        return Ok(());
    }
    let engine = Engine::new()?;
    let id = engine.create().await?;

    let started = Instant::now();
    let output = engine
        .ok(
            "execute_command",
            json!({"sandbox_id": id, "command": "sleep", "args": ["60"], "timeout_sec": 1}),
        )
        .await?;
    assert_eq!(output["exit_code"], json!(124));
    assert_eq!(output["timed_out"], json!(true));
    // timeout + kill grace, with slack for a loaded machine
    assert!(started.elapsed() < Duration::from_secs(10));

    let quick = engine
        .ok(
            "execute_command",
            json!({"sandbox_id": id, "command": "sh", "args": ["-c", "echo hi"], "timeout_sec": 5}),
        )
        .await?;
    assert_eq!(quick["stdout"], json!("hi\n"));
    assert_eq!(quick["timed_out"], json!(false));
    Ok(())
}

#[tokio::test]
async fn background_process_output_is_kept() -> Result<()> {
    if !git_available() {
        return Ok(());
    }
    let engine = Engine::new()?;
    let id = engine.create().await?;

    let started = engine
        .call(
            "start_process",
            json!({
                "sandbox_id": id,
                "command": "sh",
                "args": ["-c", "for i in 1 2 3; do echo $i; sleep 0.1; done"],
            }),
        )
        .await;
    let pid = started
        .async_handle
        .as_ref()
        .map(|handle| handle.pid)
        .ok_or_else(|| anyhow!("no async handle: {started:?}"))?;

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = engine
            .ok("get_process_status", json!({"sandbox_id": id, "pid": pid}))
            .await?;
        if status["running"] == json!(false) {
            assert_eq!(status["exit_code"], json!(0));
            assert_eq!(status["status"], json!("exited"));
            break;
        }
        if Instant::now() > deadline {
            bail!("process {pid} still running");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let logs = engine
        .ok(
            "get_process_logs",
            json!({"sandbox_id": id, "pid": pid, "tail_lines": 10}),
        )
        .await?;
    let lines: Vec<&str> = logs["lines"]
        .as_array()
        .map(|lines| lines.iter().filter_map(|line| line["text"].as_str()).collect())
        .unwrap_or_default();
    assert_eq!(lines, vec!["1", "2", "3"]);

    // Stopping an exited process is a no-op.
    engine
        .ok("stop_process", json!({"sandbox_id": id, "pid": pid}))
        .await?;
    let listed = engine.ok("list_processes", json!({"sandbox_id": id})).await?;
    assert_eq!(listed["count"], json!(1));
    Ok(())
}

#[tokio::test]
async fn reject_restores_the_host_tree() -> Result<()> {
    if !git_available() {
        return Ok(());
    }
    let engine = Engine::new()?;
    let before = tree_hash(&engine.project.join("src"))?;
    let id = engine.create().await?;

    engine
        .ok(
            "write_file",
            json!({"sandbox_id": id, "path": "ephemeral.txt", "content": "x"}),
        )
        .await?;
    engine
        .ok("delete_file", json!({"sandbox_id": id, "path": "main.rs"}))
        .await?;
    let rejected = engine
        .ok("reject_changes", json!({"sandbox_id": id, "actor": "u"}))
        .await?;
    assert_eq!(rejected["discarded"], json!(2));
    assert_eq!(rejected["status"], json!("active"));
    assert_eq!(tree_hash(&engine.project.join("src"))?, before);

    let again = engine
        .ok("reject_changes", json!({"sandbox_id": id, "actor": "u"}))
        .await?;
    assert_eq!(again["discarded"], json!(0));
    let listing = engine.ok("list_files", json!({"sandbox_id": id})).await?;
    let names: Vec<&str> = listing["entries"]
        .as_array()
        .map(|entries| entries.iter().filter_map(|entry| entry["name"].as_str()).collect())
        .unwrap_or_default();
    assert!(names.contains(&"main.rs"));
    assert!(!names.contains(&"ephemeral.txt"));
    Ok(())
}

#[tokio::test]
async fn empty_approval_then_delete_leaves_host_untouched() -> Result<()> {
    if !git_available() {
        return Ok(());
    }
    let engine = Engine::new()?;
    let before = tree_hash(&engine.project)?;
    let head = git(&engine.project, &["rev-parse", "HEAD"])?;
    let id = engine.create().await?;

    let approved = engine
        .ok("approve_changes", json!({"sandbox_id": id}))
        .await?;
    assert_eq!(approved["applied"], json!(0));
    assert_eq!(approved["commit_hash"], Value::Null);
    engine.ok("delete_sandbox", json!({"sandbox_id": id})).await?;

    assert_eq!(tree_hash(&engine.project)?, before);
    assert_eq!(git(&engine.project, &["rev-parse", "HEAD"])?, head);
    Ok(())
}

#[tokio::test]
async fn untracked_projects_cannot_be_approved() -> Result<()> {
    if !git_available() {
        return Ok(());
    }
    let engine = Engine::new_untracked()?;
    let data = engine
        .ok(
            "create_sandbox",
            json!({"scope_path": ".", "project_root": engine.project}),
        )
        .await?;
    assert_eq!(data["owner"], json!("anonymous"));
    let id = data["id"].as_str().unwrap_or_default().to_string();
    engine
        .ok(
            "write_file",
            json!({"sandbox_id": id, "path": "x.txt", "content": "x"}),
        )
        .await?;
    let result = engine
        .call("approve_changes", json!({"sandbox_id": id}))
        .await;
    assert_eq!(result.code(), Some(ErrorCode::NoVcs));
    assert!(!engine.project.join("x.txt").exists());
    Ok(())
}

impl Engine {
    /// A project outside any repository.
    fn new_untracked() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let project = temp.path().join("plain");
        fs::create_dir_all(&project)?;
        fs::write(project.join("notes.md"), "n\n")?;
        let mut config = EngineConfig::with_root(temp.path().join("engine"));
        config.overlay.mode = OverlayMode::Copy;
        let vcs = Arc::new(GitAdapter::new(&config.vcs));
        let profiles = Arc::new(ProfileStore::load(&config.profiles)?);
        let executor = Executor::new(Dependencies {
            config,
            driver: Arc::new(HostDriver::new()),
            vcs,
            profiles,
            clock: Arc::new(SystemClock),
            ids: Arc::new(RandomIds),
            telemetry: Arc::new(MemoryTelemetry::<EngineEvent>::new()),
            errors: Arc::new(MemoryErrorReporter::new()),
        })?;
        Ok(Self {
            _temp: temp,
            project,
            executor,
        })
    }
}
