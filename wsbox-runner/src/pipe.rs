//! Pipe-based spawning shared by the real drivers.
//!
//! Children get null stdin, piped stdout/stderr, their own session (and so
//! their own process group), parent-death signalling on Linux, and the
//! launch's rlimits. Output is either captured into bounded buffers
//! ([`run_to_completion`]) or streamed line by line into a log
//! ([`spawn_logged`]).

use std::io::{self, ErrorKind};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::driver::{DriverError, ExecControl, ExecOutput, ProcessExit, StartedProcess, TIMEOUT_EXIT_CODE};
use crate::limits::ResourceLimits;
use crate::log::{LogRecord, LogSink, LogStream};
use crate::process_group::{self, KillSignal, TerminationOutcome};
use crate::stream::{ReadLineResult, read_line_with_limit};

/// How long reader tasks may keep draining after the child has exited.
/// Grandchildren that inherited the pipes would otherwise hold them open.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const LOG_CHANNEL_CAPACITY: usize = 256;
const TRUNCATION_MARKER: &str = " [truncated]";

/// Apply process hardening to a command before it is spawned.
pub fn harden(command: &mut Command, limits: ResourceLimits) {
    #[cfg(target_os = "linux")]
    let parent_pid = unsafe { libc::getpid() };

    #[cfg(unix)]
    unsafe {
        command.pre_exec(move || {
            process_group::detach_from_tty()?;
            #[cfg(target_os = "linux")]
            process_group::set_parent_death_signal(parent_pid)?;
            limits.apply_to_current_process()?;
            Ok(())
        });
    }
    #[cfg(not(unix))]
    let _ = limits;

    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.kill_on_drop(true);
}

#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        let keep = chunk.len().min(room);
        self.bytes.extend_from_slice(&chunk[..keep]);
        if keep < chunk.len() {
            self.truncated = true;
        }
    }
}

async fn capture<R>(mut reader: R, sink: Arc<Mutex<Captured>>, limit: usize)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; 8_192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink.lock().push(&buf[..n], limit),
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

enum Outcome {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Stop a running child: SIGTERM to its group, wait `grace`, then SIGKILL.
pub async fn terminate_child(
    child: &mut Child,
    grace: Duration,
) -> io::Result<(ExitStatus, TerminationOutcome)> {
    if let Some(status) = child.try_wait()? {
        return Ok((status, TerminationOutcome::AlreadyExited));
    }
    let pid = child.id();

    match pid {
        Some(pid) => {
            process_group::signal_group(pid, KillSignal::Term)?;
        }
        None => child.start_kill()?,
    }
    if let Ok(status) = tokio::time::timeout(grace, child.wait()).await {
        if let Some(pid) = pid {
            let _ = process_group::signal_group(pid, KillSignal::Kill);
        }
        return Ok((status?, TerminationOutcome::Graceful));
    }

    match pid {
        Some(pid) => {
            process_group::signal_group(pid, KillSignal::Kill)?;
        }
        None => child.start_kill()?,
    }
    let status = child.wait().await?;
    Ok((status, TerminationOutcome::Forced))
}

async fn join_bounded(mut handles: Vec<JoinHandle<()>>) {
    let joined = tokio::time::timeout(READER_DRAIN_TIMEOUT, async {
        for handle in handles.iter_mut() {
            let _ = handle.await;
        }
    })
    .await;
    if joined.is_err() {
        debug!("output readers still open after drain timeout; aborting");
        for handle in &handles {
            handle.abort();
        }
    }
}

/// Spawn a hardened command and wait for it, enforcing the timeout and
/// cancellation in `control`.
pub async fn run_to_completion(
    mut command: Command,
    program: &str,
    control: &ExecControl,
) -> Result<ExecOutput, DriverError> {
    let started = Instant::now();
    let mut child = command
        .spawn()
        .map_err(|source| DriverError::spawn(program, source))?;
    let pid = child.id();

    let stdout_buf = Arc::new(Mutex::new(Captured::default()));
    let stderr_buf = Arc::new(Mutex::new(Captured::default()));
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(capture(
            stdout,
            Arc::clone(&stdout_buf),
            control.max_output_bytes,
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(capture(
            stderr,
            Arc::clone(&stderr_buf),
            control.max_output_bytes,
        )));
    }

    let deadline = async {
        match control.timeout {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };

    let outcome = tokio::select! {
        status = child.wait() => Outcome::Exited(status),
        _ = deadline => Outcome::TimedOut,
        _ = control.cancel.cancelled() => Outcome::Cancelled,
    };

    let (status, timed_out, cancelled) = match outcome {
        Outcome::Exited(status) => {
            let status = status?;
            if let Some(pid) = pid {
                let _ = process_group::signal_group(pid, KillSignal::Kill);
            }
            (status, false, false)
        }
        Outcome::TimedOut => {
            let (status, how) = terminate_child(&mut child, control.kill_grace).await?;
            warn!(program, ?pid, termination = how.as_str(), "command timed out");
            (status, true, false)
        }
        Outcome::Cancelled => {
            let (status, how) = terminate_child(&mut child, control.kill_grace).await?;
            debug!(program, ?pid, termination = how.as_str(), "command cancelled");
            (status, false, true)
        }
    };

    join_bounded(readers).await;

    let exit_code = if timed_out {
        TIMEOUT_EXIT_CODE
    } else {
        ProcessExit::from_status(status).exit_code()
    };
    let stdout = std::mem::take(&mut *stdout_buf.lock());
    let stderr = std::mem::take(&mut *stderr_buf.lock());

    Ok(ExecOutput {
        exit_code,
        stdout: String::from_utf8_lossy(&stdout.bytes).into_owned(),
        stderr: String::from_utf8_lossy(&stderr.bytes).into_owned(),
        pid,
        timed_out,
        cancelled,
        truncated: stdout.truncated || stderr.truncated,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    })
}

async fn pump_lines<R>(
    mut reader: R,
    stream: LogStream,
    started: Instant,
    max_line_bytes: usize,
    records: mpsc::Sender<LogRecord>,
) where
    R: AsyncBufRead + Unpin,
{
    loop {
        let (bytes, truncated) = match read_line_with_limit(&mut reader, max_line_bytes).await {
            Ok(ReadLineResult::Line(bytes)) => (bytes, false),
            Ok(ReadLineResult::Truncated(bytes)) => (bytes, true),
            Ok(ReadLineResult::Eof) => break,
            Err(error) => {
                debug!(%error, stream = stream.as_str(), "log pump stopped");
                break;
            }
        };
        let mut text = String::from_utf8_lossy(&bytes)
            .trim_end_matches(['\n', '\r'])
            .to_string();
        if truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        if records
            .send(LogRecord::new(started.elapsed(), stream, text))
            .await
            .is_err()
        {
            break;
        }
    }
}

/// Spawn a hardened command whose output is streamed into `sink`.
///
/// The returned exit channel fires after the child has exited and every
/// captured line has been written.
pub fn spawn_logged(
    mut command: Command,
    program: &str,
    sink: LogSink,
) -> Result<StartedProcess, DriverError> {
    // Background processes are owned by the waiter task below.
    command.kill_on_drop(false);
    let mut child = command
        .spawn()
        .map_err(|source| DriverError::spawn(program, source))?;
    let pid = child
        .id()
        .ok_or_else(|| DriverError::Io(io::Error::other("spawned child has no pid")))?;

    let started = Instant::now();
    let max_line_bytes = sink.max_line_bytes();
    let (record_tx, record_rx) = mpsc::channel::<LogRecord>(LOG_CHANNEL_CAPACITY);
    let writer = tokio::spawn(sink.drain(record_rx));

    let mut pumps = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump_lines(
            BufReader::new(stdout),
            LogStream::Stdout,
            started,
            max_line_bytes,
            record_tx.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump_lines(
            BufReader::new(stderr),
            LogStream::Stderr,
            started,
            max_line_bytes,
            record_tx.clone(),
        )));
    }
    drop(record_tx);

    let (exit_tx, exit_rx) = oneshot::channel();
    let program = program.to_string();
    tokio::spawn(async move {
        let exit = match child.wait().await {
            Ok(status) => ProcessExit::from_status(status),
            Err(error) => {
                warn!(%error, pid, program, "failed to wait for background process");
                ProcessExit {
                    code: None,
                    signal: None,
                }
            }
        };
        let _ = process_group::signal_group(pid, KillSignal::Kill);
        join_bounded(pumps).await;
        if let Err(error) = writer.await {
            warn!(%error, pid, "log writer task failed");
        }
        debug!(pid, program, exit_code = exit.exit_code(), "background process exited");
        let _ = exit_tx.send(exit);
    });

    Ok(StartedProcess { pid, exit: exit_rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captured_output_is_bounded() {
        let mut captured = Captured::default();
        captured.push(b"hello", 8);
        captured.push(b"world", 8);
        assert_eq!(captured.bytes, b"hellowor");
        assert!(captured.truncated);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_to_completion_captures_both_streams() -> anyhow::Result<()> {
        let mut command = Command::new("sh");
        command.args(["-c", "echo out; echo err >&2; exit 3"]);
        harden(&mut command, ResourceLimits::default());

        let output = run_to_completion(command, "sh", &ExecControl::default()).await?;
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert!(!output.timed_out);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_reports_124() -> anyhow::Result<()> {
        let mut command = Command::new("sh");
        command.args(["-c", "echo started; sleep 30"]);
        harden(&mut command, ResourceLimits::default());
        let control = ExecControl {
            timeout: Some(Duration::from_millis(300)),
            kill_grace: Duration::from_millis(500),
            ..ExecControl::default()
        };

        let output = run_to_completion(command, "sh", &control).await?;
        assert_eq!(output.exit_code, TIMEOUT_EXIT_CODE);
        assert!(output.timed_out);
        assert_eq!(output.stdout, "started\n");
        assert!(output.duration_ms < 10_000);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_stops_the_child() -> anyhow::Result<()> {
        let mut command = Command::new("sleep");
        command.arg("30");
        harden(&mut command, ResourceLimits::default());
        let control = ExecControl::default();
        let cancel = control.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let output = run_to_completion(command, "sleep", &control).await?;
        assert!(output.cancelled);
        assert_eq!(output.exit_code, 128 + libc::SIGTERM);
        Ok(())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spawn_logged_writes_tagged_lines() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("p.log");
        let sink = LogSink::new(tokio::fs::File::create(&path).await?, 1024);

        let mut command = Command::new("sh");
        command.args(["-c", "echo one; echo two >&2; printf tail"]);
        harden(&mut command, ResourceLimits::default());
        let started = spawn_logged(command, "sh", sink)?;
        let exit = started.exit.await?;
        assert_eq!(exit.exit_code(), 0);

        let content = tokio::fs::read_to_string(&path).await?;
        let mut lines: Vec<(LogStream, String)> = content
            .lines()
            .map(crate::log::parse_log_line)
            .map(|line| (line.stream, line.text))
            .collect();
        lines.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            lines,
            vec![
                (LogStream::Stdout, "one".to_string()),
                (LogStream::Stdout, "tail".to_string()),
                (LogStream::Stderr, "two".to_string()),
            ]
        );
        Ok(())
    }
}
