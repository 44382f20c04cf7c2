//! Provider-facing request/response shapes.

use serde::{Deserialize, Serialize};

use super::task::TokenUsage;

/// Request handed to a provider's execute path.
#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub prompt: String,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub tools: Vec<String>,
    pub work_dir: String,
    pub system_prompt: String,
}

impl ExecuteRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
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
    pub fn with_work_dir(mut self, work_dir: impl Into<String>) -> Self {
        self.work_dir = work_dir.into();
        self
    }
}

/// Why the provider stopped generating.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    EndTurn,
    MaxTokens,
    ContentFilter,
    ToolUse,
}

/// A tool invocation observed during execution (RPC providers report these
/// from `item/completed` notifications).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Tool or command name.
    pub name: String,
    /// Tool input or command line.
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Response assembled from a provider execution.
#[derive(Debug, Clone, Default)]
pub struct ExecuteResponse {
    pub output: String,
    pub token_usage: TokenUsage,
    pub duration_ms: u64,
    pub model: String,
    pub stop_reason: StopReason,
    pub tool_calls: Vec<ToolCall>,
}

/// Capability flags advertised by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderCapabilities {
    pub supports_computer_use: bool,
}
