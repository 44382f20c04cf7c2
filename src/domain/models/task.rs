//! Task wire model: requests arriving from the orchestrator and the
//! events the bridge emits back.
//!
//! Field names follow the transport's camelCase convention; every outbound
//! event echoes the `execution_id` of the request that produced it.

use serde::{Deserialize, Serialize};

/// A task request received over the duplex channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskRequest {
    /// Opaque id echoed in every event; unique per task.
    pub execution_id: String,
    /// Free-form prompt for the provider.
    pub prompt: String,
    /// Requested model name; may be empty.
    pub model: String,
    /// Explicit provider tag; empty means model-prefix resolution.
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    /// Working directory for the task; empty means the bridge default.
    pub work_dir: String,
    /// Per-task timeout; zero or negative falls back to the default.
    pub timeout_seconds: i64,
}

impl TaskRequest {
    pub fn new(execution_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    #[must_use]
    pub fn with_work_dir(mut self, work_dir: impl Into<String>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    #[must_use]
    pub const fn with_timeout(mut self, seconds: i64) -> Self {
        self.timeout_seconds = seconds;
        self
    }
}

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
    pub cache_read: u64,
    pub cache_creation: u64,
}

impl TokenUsage {
    pub const fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            total: input + output,
            cache_read: 0,
            cache_creation: 0,
        }
    }
}

/// Successful completion event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub execution_id: String,
    pub output: String,
    /// 0 on success.
    pub exit_code: i32,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
}

/// Closed set of error codes surfaced at the transport boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ProviderNotFound,
    SandboxViolation,
    Timeout,
    Cancelled,
    ProviderError,
    InternalError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ProviderNotFound => "PROVIDER_NOT_FOUND",
            Self::SandboxViolation => "SANDBOX_VIOLATION",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        };
        f.write_str(s)
    }
}

/// Failure event; `retryable` tells the orchestrator whether resubmission
/// can help.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub execution_id: String,
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

/// Incremental progress event. `progress` is monotone non-decreasing per
/// execution id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub execution_id: String,
    pub progress: u8,
    pub message: String,
    #[serde(rename = "type")]
    pub progress_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_delta: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accumulated_text: Option<String>,
}

impl TaskProgress {
    /// Plain progress marker without streamed text.
    pub fn status(
        execution_id: impl Into<String>,
        progress: u8,
        message: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            progress,
            message: message.into(),
            progress_type: "text".to_string(),
            text_delta: None,
            accumulated_text: None,
        }
    }

    /// Streamed-text progress carrying a coalesced delta.
    pub fn text(
        execution_id: impl Into<String>,
        delta: impl Into<String>,
        accumulated: impl Into<String>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            progress: 50,
            message: String::new(),
            progress_type: "text".to_string(),
            text_delta: Some(delta.into()),
            accumulated_text: Some(accumulated.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_request_round_trip() {
        let req = TaskRequest::new("e1", "hello")
            .with_model("claude-sonnet-4")
            .with_timeout(60);

        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"executionId\":\"e1\""));
        assert!(json.contains("\"timeoutSeconds\":60"));

        let back: TaskRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.execution_id, "e1");
        assert_eq!(back.model, "claude-sonnet-4");
    }

    #[test]
    fn test_task_request_tolerates_missing_fields() {
        let req: TaskRequest =
            serde_json::from_str(r#"{"executionId":"e2","prompt":"hi"}"#).unwrap();
        assert_eq!(req.execution_id, "e2");
        assert!(req.provider.is_empty());
        assert_eq!(req.timeout_seconds, 0);
    }

    #[test]
    fn test_error_code_serialization() {
        let err = TaskError {
            execution_id: "e1".to_string(),
            code: ErrorCode::SandboxViolation,
            message: "denied".to_string(),
            retryable: false,
        };
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"code\":\"SANDBOX_VIOLATION\""));
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage::new(10, 20);
        assert_eq!(usage.total, 30);
    }

    #[test]
    fn test_progress_text_event() {
        let p = TaskProgress::text("e1", "chunk", "chunk");
        assert_eq!(p.progress, 50);
        assert_eq!(p.progress_type, "text");
        assert_eq!(p.text_delta.as_deref(), Some("chunk"));
    }
}
