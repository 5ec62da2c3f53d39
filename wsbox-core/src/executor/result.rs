use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{EngineError, ErrorCode};

/// Points at a background process started by `start_process`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncHandle {
    pub sandbox_id: Uuid,
    pub pid: u32,
}

/// The envelope every tool call returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub async_handle: Option<AsyncHandle>,
}

impl ExecutionResult {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
            async_handle: None,
        }
    }

    pub fn failure(error: &EngineError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.public_message()),
            error_code: Some(error.code()),
            async_handle: None,
        }
    }

    /// A failed outcome that still carries data, e.g. an approval that
    /// rolled the host tree back.
    pub fn partial(data: Value, message: String, code: ErrorCode) -> Self {
        Self {
            success: false,
            data: Some(data),
            error: Some(message),
            error_code: Some(code),
            async_handle: None,
        }
    }

    pub fn with_handle(mut self, handle: AsyncHandle) -> Self {
        self.async_handle = Some(handle);
        self
    }

    pub fn code(&self) -> Option<ErrorCode> {
        self.error_code
    }
}
