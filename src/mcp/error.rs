//! Failures of a tool call or resource read, and their MCP error codes.
use rmcp::ErrorData as McpError;
use rmcp::model::ErrorCode;
use thiserror::Error;

/// Everything a request can fail with. Each maps onto one error code.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("tool '{tool}' is unavailable: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("tool '{tool}' failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidParams(_) => -32602,
            Self::Internal(_) => -32603,
            Self::ResourceNotFound(_) => -32002,
            Self::ToolUnavailable { .. } => -32001,
            Self::ToolFailed { .. } => -32000,
        }
    }

    pub fn tool_failed(tool: &str, message: impl std::fmt::Display) -> Self {
        Self::ToolFailed {
            tool: tool.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<DispatchError> for McpError {
    fn from(e: DispatchError) -> Self {
        McpError::new(ErrorCode(e.code()), e.to_string(), None)
    }
}
