use serde::Serialize;
use uuid::Uuid;

use crate::sandbox::SandboxStatus;

/// Lifecycle events recorded through the engine's telemetry sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    SandboxTransition {
        sandbox_id: Uuid,
        from: Option<SandboxStatus>,
        to: SandboxStatus,
    },
    OverlayFallback {
        sandbox_id: Uuid,
        reason: String,
    },
    ProcessStarted {
        sandbox_id: Uuid,
        pid: u32,
        command: String,
    },
    ProcessExited {
        sandbox_id: Uuid,
        pid: u32,
        exit_code: Option<i32>,
        killed: bool,
    },
    ProcessPurged {
        sandbox_id: Uuid,
        pid: u32,
    },
    ChangesApproved {
        sandbox_id: Uuid,
        applied: usize,
        commit_hash: Option<String>,
    },
    ChangesRejected {
        sandbox_id: Uuid,
        discarded: usize,
    },
    FilesDiscarded {
        sandbox_id: Uuid,
        discarded: usize,
    },
}
