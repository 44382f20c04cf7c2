//! Mock provider for tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::domain::errors::{ProviderError, ProviderResult};
use crate::domain::models::{ExecuteRequest, ExecuteResponse, StopReason, TokenUsage};
use crate::domain::ports::{Provider, StreamCallback};

/// Scripted behavior for one mock execution.
#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Output text on success.
    pub output: String,
    /// Token counts reported.
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Simulated execution delay.
    pub delay: Duration,
    /// Error returned instead of a response.
    pub error: Option<ProviderError>,
    /// Deltas emitted through the stream callback before completing.
    pub stream_deltas: Vec<String>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            output: "mock output".to_string(),
            input_tokens: 100,
            output_tokens: 50,
            delay: Duration::ZERO,
            error: None,
            stream_deltas: Vec::new(),
        }
    }
}

impl MockBehavior {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn failure(error: ProviderError) -> Self {
        Self {
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Configurable provider used across the test suites.
pub struct MockProvider {
    name: String,
    behavior: MockBehavior,
    supports_all: bool,
    streaming: bool,
    config_error: Option<String>,
    call_count: AtomicU32,
}

impl MockProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            behavior: MockBehavior::default(),
            supports_all: false,
            streaming: false,
            config_error: None,
            call_count: AtomicU32::new(0),
        }
    }

    #[must_use]
    pub fn with_behavior(mut self, behavior: MockBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    /// Make `supports` return true for every model.
    #[must_use]
    pub const fn with_supports_all(mut self) -> Self {
        self.supports_all = true;
        self
    }

    #[must_use]
    pub const fn with_streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    #[must_use]
    pub fn with_invalid_config(mut self, message: impl Into<String>) -> Self {
        self.config_error = Some(message.into());
        self
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::SeqCst)
    }

    async fn run(
        &self,
        cancel: &tokio_util::sync::CancellationToken,
        on_delta: Option<&StreamCallback>,
    ) -> ProviderResult<ExecuteResponse> {
        self.call_count.fetch_add(1, Ordering::SeqCst);

        if !self.behavior.delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(self.behavior.delay) => {}
                () = cancel.cancelled() => return Err(ProviderError::Cancelled),
            }
        }

        if let Some(err) = &self.behavior.error {
            return Err(err.clone());
        }

        let mut accumulated = String::new();
        if let Some(callback) = on_delta {
            for delta in &self.behavior.stream_deltas {
                accumulated.push_str(delta);
                callback(delta, &accumulated);
            }
        }

        Ok(ExecuteResponse {
            output: self.behavior.output.clone(),
            token_usage: TokenUsage::new(self.behavior.input_tokens, self.behavior.output_tokens),
            duration_ms: u64::try_from(self.behavior.delay.as_millis()).unwrap_or(0),
            model: "mock-model".to_string(),
            stop_reason: StopReason::EndTurn,
            tool_calls: Vec::new(),
        })
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, model: &str) -> bool {
        self.supports_all || model.starts_with(&self.name)
    }

    fn validate_config(&self) -> ProviderResult<()> {
        match &self.config_error {
            Some(message) => Err(ProviderError::InvalidConfig(message.clone())),
            None => Ok(()),
        }
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn execute(
        &self,
        _request: ExecuteRequest,
        cancel: tokio_util::sync::CancellationToken,
    ) -> ProviderResult<ExecuteResponse> {
        self.run(&cancel, None).await
    }

    async fn execute_streaming(
        &self,
        _request: ExecuteRequest,
        cancel: tokio_util::sync::CancellationToken,
        on_delta: StreamCallback,
    ) -> ProviderResult<ExecuteResponse> {
        self.run(&cancel, Some(&on_delta)).await
    }
}
