//! A driver that never spawns anything.
//!
//! Every call is recorded. `exec` returns queued outputs (or a successful
//! empty one), `start_process` writes canned log lines and either exits
//! immediately or stays "running" until signalled. Used by engine tests that
//! need deterministic pids and exit timing.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::driver::{
    DriverError, ExecControl, ExecOutput, LaunchSpec, ProcessExit, SandboxDriver, StartedProcess,
};
use crate::log::{LogRecord, LogSink, LogStream};
use crate::process_group::KillSignal;

/// First pid handed out by a fresh driver.
pub const FIRST_FAKE_PID: u32 = 100_000;

#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Exec(LaunchSpec),
    Start(LaunchSpec),
    Signal { pid: u32, signal: KillSignal },
}

/// Script for one fake background process.
#[derive(Debug, Clone, Default)]
pub struct CannedProcess {
    pub lines: Vec<(LogStream, String)>,
    /// `None` keeps the process running until it is signalled.
    pub exit_code: Option<i32>,
    /// Whether SIGTERM is ignored, so only SIGKILL ends the process.
    pub ignore_term: bool,
}

impl CannedProcess {
    pub fn exiting(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    pub fn running() -> Self {
        Self::default()
    }

    pub fn with_line(mut self, stream: LogStream, text: impl Into<String>) -> Self {
        self.lines.push((stream, text.into()));
        self
    }
}

#[derive(Debug)]
struct Running {
    exit: oneshot::Sender<ProcessExit>,
    ignore_term: bool,
}

#[derive(Debug, Default)]
struct State {
    invocations: Vec<Invocation>,
    exec_results: VecDeque<ExecOutput>,
    starts: VecDeque<CannedProcess>,
    next_pid: u32,
    running: HashMap<u32, Running>,
    fail_next_start: Option<String>,
    forced_pids: VecDeque<u32>,
}

#[derive(Debug)]
pub struct RecordingDriver {
    state: Mutex<State>,
}

impl Default for RecordingDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingDriver {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_pid: FIRST_FAKE_PID,
                ..State::default()
            }),
        }
    }

    pub fn push_exec_result(&self, output: ExecOutput) {
        self.state.lock().exec_results.push_back(output);
    }

    pub fn push_process(&self, process: CannedProcess) {
        self.state.lock().starts.push_back(process);
    }

    /// Make the next `start_process` call fail with a spawn error.
    pub fn fail_next_start(&self, message: impl Into<String>) {
        self.state.lock().fail_next_start = Some(message.into());
    }

    /// Hand out `pid` on the next start instead of the next sequential one.
    pub fn reuse_pid(&self, pid: u32) {
        self.state.lock().forced_pids.push_back(pid);
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.state.lock().invocations.clone()
    }

    pub fn signals(&self) -> Vec<(u32, KillSignal)> {
        self.state
            .lock()
            .invocations
            .iter()
            .filter_map(|inv| match inv {
                Invocation::Signal { pid, signal } => Some((*pid, *signal)),
                _ => None,
            })
            .collect()
    }

    pub fn running_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = self.state.lock().running.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// End a running fake process as if it exited by itself.
    pub fn finish(&self, pid: u32, code: i32) -> bool {
        let running = self.state.lock().running.remove(&pid);
        match running {
            Some(running) => running.exit.send(ProcessExit::exited(code)).is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl SandboxDriver for RecordingDriver {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn exec(
        &self,
        spec: &LaunchSpec,
        control: &ExecControl,
    ) -> Result<ExecOutput, DriverError> {
        let queued = {
            let mut state = self.state.lock();
            state.invocations.push(Invocation::Exec(spec.clone()));
            state.exec_results.pop_front()
        };
        if control.cancel.is_cancelled() {
            return Ok(ExecOutput {
                exit_code: 128 + KillSignal::Term.number(),
                cancelled: true,
                ..ExecOutput::default()
            });
        }
        Ok(queued.unwrap_or_default())
    }

    async fn start_process(
        &self,
        spec: &LaunchSpec,
        mut log: LogSink,
    ) -> Result<StartedProcess, DriverError> {
        let (pid, canned) = {
            let mut state = self.state.lock();
            state.invocations.push(Invocation::Start(spec.clone()));
            if let Some(message) = state.fail_next_start.take() {
                return Err(DriverError::spawn(
                    &spec.program,
                    std::io::Error::new(std::io::ErrorKind::NotFound, message),
                ));
            }
            let pid = match state.forced_pids.pop_front() {
                Some(pid) => pid,
                None => {
                    let pid = state.next_pid;
                    state.next_pid += 1;
                    pid
                }
            };
            (pid, state.starts.pop_front().unwrap_or_default())
        };

        for (index, (stream, text)) in canned.lines.iter().enumerate() {
            let elapsed = Duration::from_millis(index as u64);
            log.write_record(&LogRecord::new(elapsed, *stream, text.clone()))
                .await?;
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        match canned.exit_code {
            Some(code) => {
                let _ = exit_tx.send(ProcessExit::exited(code));
            }
            None => {
                self.state.lock().running.insert(
                    pid,
                    Running {
                        exit: exit_tx,
                        ignore_term: canned.ignore_term,
                    },
                );
            }
        }
        Ok(StartedProcess { pid, exit: exit_rx })
    }

    fn signal(&self, pid: u32, signal: KillSignal) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.invocations.push(Invocation::Signal { pid, signal });
        let stops = match state.running.get(&pid) {
            Some(running) => match signal {
                KillSignal::Kill => true,
                KillSignal::Term | KillSignal::Int => !running.ignore_term,
            },
            None => false,
        };
        if stops && let Some(running) = state.running.remove(&pid) {
            let _ = running.exit.send(ProcessExit::signaled(signal.number()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn running_process_ends_on_term() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let driver = RecordingDriver::new();
        driver.push_process(CannedProcess::running().with_line(LogStream::Stdout, "ready"));

        let sink = LogSink::new(tokio::fs::File::create(dir.path().join("log")).await?, 1024);
        let started = driver
            .start_process(&LaunchSpec::new(dir.path(), "server"), sink)
            .await?;
        assert_eq!(started.pid, FIRST_FAKE_PID);
        assert_eq!(driver.running_pids(), vec![FIRST_FAKE_PID]);

        driver.signal(started.pid, KillSignal::Term)?;
        let exit = started.exit.await?;
        assert_eq!(exit.signal, Some(KillSignal::Term.number()));
        assert!(driver.running_pids().is_empty());

        let log = tokio::fs::read_to_string(dir.path().join("log")).await?;
        assert!(log.ends_with("\tstdout\tready\n"));
        Ok(())
    }

    #[tokio::test]
    async fn stubborn_process_needs_kill() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let driver = RecordingDriver::new();
        driver.push_process(CannedProcess {
            ignore_term: true,
            ..CannedProcess::running()
        });
        let sink = LogSink::new(tokio::fs::File::create(dir.path().join("log")).await?, 1024);
        let started = driver
            .start_process(&LaunchSpec::new(dir.path(), "daemon"), sink)
            .await?;

        driver.signal(started.pid, KillSignal::Term)?;
        assert_eq!(driver.running_pids(), vec![started.pid]);
        driver.signal(started.pid, KillSignal::Kill)?;
        assert!(driver.running_pids().is_empty());
        assert_eq!(
            driver.signals(),
            vec![
                (started.pid, KillSignal::Term),
                (started.pid, KillSignal::Kill)
            ]
        );
        Ok(())
    }
}
