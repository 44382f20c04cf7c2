//! Provider errors and their mapping to the transport error taxonomy.

use thiserror::Error;

use super::models::{ErrorCode, TaskError};

/// Errors produced by provider implementations.
///
/// These stay rich inside the core; the executor unwraps them at the edge
/// into a [`TaskError`] payload with a closed code set.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider not found: {0}")]
    NotFound(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("missing API key: {0}")]
    NoApiKey(String),

    #[error("execution cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    Timeout,

    #[error("CLI execution timed out")]
    CliTimeout,

    #[error("CLI execution failed (exit {exit_code:?}): {stderr}")]
    CliExecution {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("RPC handshake timed out")]
    HandshakeTimeout,

    #[error("RPC connection closed")]
    ConnectionClosed,

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),

    #[error("{0}")]
    Internal(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

impl ProviderError {
    /// Whether resubmitting the same task can reasonably succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Timeout | Self::CliTimeout | Self::Network(_)
        )
    }

    /// Map to the closed transport code set.
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::ProviderNotFound,
            Self::Timeout | Self::CliTimeout => ErrorCode::Timeout,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::RateLimited(_) | Self::NoApiKey(_) => ErrorCode::ProviderError,
            _ => ErrorCode::InternalError,
        }
    }

    /// Build the transport-facing error event for an execution.
    pub fn to_task_error(&self, execution_id: &str) -> TaskError {
        TaskError {
            execution_id: execution_id.to_string(),
            code: self.code(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}
