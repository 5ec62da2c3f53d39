//! Process plumbing for the wsbox engine.
//!
//! The [`SandboxDriver`] trait is the seam between the engine and whatever
//! isolates a command: [`BubblewrapDriver`] runs it inside fresh namespaces,
//! [`HostDriver`] runs it as a plain child confined to the sandbox directory,
//! and [`RecordingDriver`] never spawns anything and just records what it was
//! asked to do. All real drivers share the helpers in [`pipe`], which put the
//! child in its own process group, apply rlimits, and capture output.

pub mod bubblewrap;
pub mod driver;
pub mod env;
pub mod host;
pub mod limits;
pub mod log;
pub mod pipe;
pub mod process_group;
pub mod recording;
pub mod stream;

pub use bubblewrap::BubblewrapDriver;
pub use driver::{
    BindMount, DriverError, ExecControl, ExecOutput, LaunchSpec, ProcessExit, SandboxDriver,
    StartedProcess, TIMEOUT_EXIT_CODE,
};
pub use host::HostDriver;
pub use limits::ResourceLimits;
pub use log::{LogRecord, LogSink, LogStream, ParsedLogLine, parse_log_line};
pub use process_group::{KillSignal, TerminationOutcome};
pub use recording::{CannedProcess, FIRST_FAKE_PID, Invocation, RecordingDriver};
