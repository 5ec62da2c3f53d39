#![cfg(unix)]

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use wsbox_runner::env::build_sandbox_env;
use wsbox_runner::{
    DriverError, ExecControl, HostDriver, KillSignal, LaunchSpec, LogSink, SandboxDriver,
    parse_log_line,
};

fn shell(root: &std::path::Path, script: &str) -> LaunchSpec {
    let mut spec = LaunchSpec::new(root, "sh").with_args(["-c", script]);
    spec.env = build_sandbox_env(std::env::vars(), &[], "test-sandbox");
    spec
}

#[tokio::test]
async fn exec_runs_in_workdir_with_sanitized_env() -> Result<()> {
    let root = assert_fs::TempDir::new()?;
    std::fs::create_dir(root.path().join("sub"))?;
    let mut spec = shell(root.path(), "pwd; echo \"$WSBOX_SANDBOX\"; echo \"${HOME:-unset}\"");
    spec.workdir = PathBuf::from("sub");

    let output = HostDriver::new()
        .exec(&spec, &ExecControl::default())
        .await?;

    let lines: Vec<&str> = output.stdout.lines().collect();
    assert_eq!(output.exit_code, 0);
    assert!(lines[0].ends_with("/sub"));
    assert_eq!(lines[1], "test-sandbox");
    assert_eq!(lines[2], "unset");
    Ok(())
}

#[tokio::test]
async fn exec_in_missing_workdir_fails_before_spawn() -> Result<()> {
    let root = assert_fs::TempDir::new()?;
    let mut spec = shell(root.path(), "true");
    spec.workdir = PathBuf::from("nope");

    let err = HostDriver::new()
        .exec(&spec, &ExecControl::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::MissingWorkdir(_)));
    Ok(())
}

#[tokio::test]
async fn unknown_program_is_a_spawn_error() -> Result<()> {
    let root = assert_fs::TempDir::new()?;
    let mut spec = LaunchSpec::new(root.path(), "definitely-not-a-real-binary-wsbox");
    spec.env = BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]);

    let err = HostDriver::new()
        .exec(&spec, &ExecControl::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DriverError::Spawn { .. }));
    Ok(())
}

#[tokio::test]
async fn background_process_stops_on_term() -> Result<()> {
    let root = assert_fs::TempDir::new()?;
    let log_path = root.path().join("server.log");
    let sink = LogSink::new(tokio::fs::File::create(&log_path).await?, 4096);
    let spec = shell(root.path(), "echo ready; exec sleep 30");

    let driver = HostDriver::new();
    let started = driver.start_process(&spec, sink).await?;

    // Wait for the first line to land.
    let mut content = String::new();
    for _ in 0..50 {
        content = tokio::fs::read_to_string(&log_path).await?;
        if !content.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(parse_log_line(content.trim_end()).text, "ready");

    driver.signal(started.pid, KillSignal::Term)?;
    let exit = tokio::time::timeout(Duration::from_secs(10), started.exit).await??;
    assert_eq!(exit.signal, Some(libc::SIGTERM));

    // Signalling a reaped group is not an error.
    driver.signal(started.pid, KillSignal::Kill)?;
    Ok(())
}
