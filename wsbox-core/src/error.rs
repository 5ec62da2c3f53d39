use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use wsbox_commons::PathError;
use wsbox_commons::fs::is_quota_error;
use wsbox_runner::DriverError;

/// Machine-readable failure class carried in every error result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UnknownTool,
    InvalidArgs,
    NotFound,
    Conflict,
    InvalidState,
    PathEscape,
    DriverFailure,
    OverlayUnsupported,
    QuotaExceeded,
    NoVcs,
    InternalError,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 11] = [
        ErrorCode::UnknownTool,
        ErrorCode::InvalidArgs,
        ErrorCode::NotFound,
        ErrorCode::Conflict,
        ErrorCode::InvalidState,
        ErrorCode::PathEscape,
        ErrorCode::DriverFailure,
        ErrorCode::OverlayUnsupported,
        ErrorCode::QuotaExceeded,
        ErrorCode::NoVcs,
        ErrorCode::InternalError,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::UnknownTool => "unknown_tool",
            ErrorCode::InvalidArgs => "invalid_args",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Conflict => "conflict",
            ErrorCode::InvalidState => "invalid_state",
            ErrorCode::PathEscape => "path_escape",
            ErrorCode::DriverFailure => "driver_failure",
            ErrorCode::OverlayUnsupported => "overlay_unsupported",
            ErrorCode::QuotaExceeded => "quota_exceeded",
            ErrorCode::NoVcs => "no_vcs",
            ErrorCode::InternalError => "internal_error",
        }
    }

    /// Errors the caller can fix by changing the request.
    pub fn is_caller_fixable(self) -> bool {
        matches!(
            self,
            ErrorCode::UnknownTool
                | ErrorCode::InvalidArgs
                | ErrorCode::NotFound
                | ErrorCode::PathEscape
                | ErrorCode::InvalidState
                | ErrorCode::Conflict
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),
    #[error("{0}")]
    InvalidArgs(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    InvalidState(String),
    #[error("{0}")]
    PathEscape(String),
    #[error("sandbox driver failure: {0}")]
    DriverFailure(String),
    #[error("overlay unsupported: {0}")]
    OverlayUnsupported(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("{0}")]
    NoVcs(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("internal error: {0:#}")]
    Internal(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::UnknownTool(_) => ErrorCode::UnknownTool,
            EngineError::InvalidArgs(_) => ErrorCode::InvalidArgs,
            EngineError::NotFound(_) => ErrorCode::NotFound,
            EngineError::Conflict(_) => ErrorCode::Conflict,
            EngineError::InvalidState(_) => ErrorCode::InvalidState,
            EngineError::PathEscape(_) => ErrorCode::PathEscape,
            EngineError::DriverFailure(_) => ErrorCode::DriverFailure,
            EngineError::OverlayUnsupported(_) => ErrorCode::OverlayUnsupported,
            EngineError::QuotaExceeded(_) => ErrorCode::QuotaExceeded,
            EngineError::NoVcs(_) => ErrorCode::NoVcs,
            // The code set is closed; cancellation reports as internal.
            EngineError::Cancelled | EngineError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Message safe to hand to callers. Internal details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            EngineError::Internal(_) => "internal engine error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn invalid_args(message: impl Into<String>) -> Self {
        EngineError::InvalidArgs(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        EngineError::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        EngineError::Conflict(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        EngineError::InvalidState(message.into())
    }

    /// Map an I/O failure: full disks become `quota_exceeded`, everything
    /// else is internal with `context` attached.
    pub fn io(error: io::Error, context: impl fmt::Display) -> Self {
        if is_quota_error(&error) {
            return EngineError::QuotaExceeded(format!("{context}: {error}"));
        }
        EngineError::Internal(anyhow::Error::new(error).context(context.to_string()))
    }

    /// Like [`EngineError::io`], but a missing path is `not_found`.
    pub fn io_lookup(error: io::Error, context: impl fmt::Display) -> Self {
        if error.kind() == io::ErrorKind::NotFound {
            return EngineError::NotFound(format!("{context}: not found"));
        }
        Self::io(error, context)
    }
}

impl From<PathError> for EngineError {
    fn from(error: PathError) -> Self {
        match error {
            PathError::Escape { .. } => EngineError::PathEscape(error.to_string()),
            PathError::Invalid { .. } => EngineError::InvalidArgs(error.to_string()),
        }
    }
}

impl From<DriverError> for EngineError {
    fn from(error: DriverError) -> Self {
        if let Some(io) = error.io_error()
            && is_quota_error(io)
        {
            return EngineError::QuotaExceeded(error.to_string());
        }
        match error {
            DriverError::MissingWorkdir(_) => EngineError::InvalidArgs(error.to_string()),
            other => EngineError::DriverFailure(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(error: tokio::task::JoinError) -> Self {
        EngineError::Internal(anyhow::Error::new(error).context("blocking task failed"))
    }
}
