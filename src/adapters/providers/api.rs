//! Anthropic Messages API provider.
//!
//! In-process HTTPS client with linear-backoff retry: 5xx, 429, and network
//! errors are retried up to `max_retries` times with `base_delay × attempt`
//! waits; other 4xx fail immediately. Cancellation short-circuits both the
//! in-flight request and the backoff sleeps.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::errors::{ProviderError, ProviderResult};
use crate::domain::models::{
    AnthropicApiSettings, ExecuteRequest, ExecuteResponse, StopReason, TokenUsage,
};
use crate::domain::ports::Provider;

const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Configuration for the API provider.
#[derive(Debug, Clone)]
pub struct ApiProviderConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub api_version: String,
    pub default_model: String,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for ApiProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.anthropic.com".to_string(),
            api_version: "2023-06-01".to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            max_retries: 3,
            timeout_secs: 300,
        }
    }
}

impl From<&AnthropicApiSettings> for ApiProviderConfig {
    fn from(settings: &AnthropicApiSettings) -> Self {
        Self {
            api_key: settings.api_key.clone(),
            base_url: settings.base_url.clone(),
            api_version: settings.api_version.clone(),
            max_retries: settings.max_retries,
            timeout_secs: settings.timeout_secs,
            ..Self::default()
        }
    }
}

impl ApiProviderConfig {
    /// API key from config or the environment.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok())
    }

    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiUsage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ApiContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {},
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ApiContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: ApiUsage,
}

/// Anthropic Messages API provider.
pub struct ApiProvider {
    config: ApiProviderConfig,
    client: Client,
}

impl ApiProvider {
    pub fn new(config: ApiProviderConfig) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ProviderError::InvalidConfig(format!("http client: {e}")))?;
        Ok(Self { config, client })
    }

    fn build_request(&self, request: &ExecuteRequest) -> MessagesRequest {
        let model = if request.model.is_empty() {
            self.config.default_model.clone()
        } else {
            request.model.clone()
        };
        MessagesRequest {
            model,
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: if request.system_prompt.is_empty() {
                None
            } else {
                Some(request.system_prompt.clone())
            },
            messages: vec![ApiMessage {
                role: "user",
                content: request.prompt.clone(),
            }],
        }
    }

    async fn send_once(
        &self,
        api_key: &str,
        body: &MessagesRequest,
        cancel: &CancellationToken,
    ) -> ProviderResult<MessagesResponse> {
        let send = self
            .client
            .post(format!("{}/v1/messages", self.config.base_url))
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-api-key", api_key)
            .header("anthropic-version", &self.config.api_version)
            .json(body)
            .send();

        let response = tokio::select! {
            response = send => response.map_err(|e| ProviderError::Network(e.to_string()))?,
            () = cancel.cancelled() => return Err(ProviderError::Cancelled),
        };

        let status = response.status();
        if status.is_success() {
            return response
                .json::<MessagesResponse>()
                .await
                .map_err(|e| ProviderError::InvalidResponse(e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited(body),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::NoApiKey(body),
            _ => ProviderError::Api {
                status: status.as_u16(),
                message: body,
            },
        })
    }

    const fn should_retry(error: &ProviderError) -> bool {
        match error {
            ProviderError::RateLimited(_) | ProviderError::Network(_) => true,
            ProviderError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[async_trait]
impl Provider for ApiProvider {
    fn name(&self) -> &str {
        "api"
    }

    fn supports(&self, model: &str) -> bool {
        model.starts_with("claude-")
    }

    fn validate_config(&self) -> ProviderResult<()> {
        if self.config.resolve_api_key().is_none() {
            return Err(ProviderError::NoApiKey(
                "ANTHROPIC_API_KEY is not configured".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> ProviderResult<ExecuteResponse> {
        let api_key = self
            .config
            .resolve_api_key()
            .ok_or_else(|| ProviderError::NoApiKey("ANTHROPIC_API_KEY is not configured".into()))?;

        let body = self.build_request(&request);
        let started = Instant::now();
        let mut attempt: u32 = 0;

        let response = loop {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }

            match self.send_once(&api_key, &body, &cancel).await {
                Ok(response) => break response,
                Err(error) => {
                    attempt += 1;
                    if !Self::should_retry(&error) || attempt > self.config.max_retries {
                        return Err(error);
                    }
                    let backoff = RETRY_BASE_DELAY * attempt;
                    warn!(
                        attempt,
                        max_retries = self.config.max_retries,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "Retrying API request"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        () = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    }
                }
            }
        };

        let output = response
            .content
            .iter()
            .filter_map(|block| match block {
                ApiContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        let stop_reason = match response.stop_reason.as_deref() {
            Some("max_tokens") => StopReason::MaxTokens,
            Some("tool_use") => StopReason::ToolUse,
            Some("content_filter") => StopReason::ContentFilter,
            _ => StopReason::EndTurn,
        };

        debug!(
            model = %response.model,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "API call completed"
        );

        Ok(ExecuteResponse {
            output,
            token_usage: TokenUsage {
                input: response.usage.input_tokens,
                output: response.usage.output_tokens,
                total: response.usage.input_tokens + response.usage.output_tokens,
                cache_read: response.usage.cache_read_input_tokens,
                cache_creation: response.usage.cache_creation_input_tokens,
            },
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(0),
            model: response.model,
            stop_reason,
            tool_calls: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider_for(server: &mockito::ServerGuard) -> ApiProvider {
        let config = ApiProviderConfig::default()
            .with_api_key("test-key")
            .with_base_url(server.url());
        ApiProvider::new(config).unwrap()
    }

    fn success_body() -> String {
        serde_json::json!({
            "id": "msg_1",
            "content": [{"type": "text", "text": "hello"}],
            "model": "claude-sonnet-4-20250514",
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 10, "output_tokens": 20}
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_execute_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .match_header("x-api-key", "test-key")
            .with_status(200)
            .with_body(success_body())
            .create_async()
            .await;

        let provider = provider_for(&server);
        let response = provider
            .execute(
                ExecuteRequest::new("hi").with_model("claude-sonnet-4"),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(response.output, "hello");
        assert_eq!(response.token_usage.input, 10);
        assert_eq!(response.token_usage.output, 20);
        assert_eq!(response.stop_reason, StopReason::EndTurn);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_retries_on_server_error() {
        let mut server = mockito::Server::new_async().await;
        let failures = server
            .mock("POST", "/v1/messages")
            .with_status(503)
            .with_body("overloaded")
            .expect(2)
            .create_async()
            .await;
        let success = server
            .mock("POST", "/v1/messages")
            .with_status(200)
            .with_body(success_body())
            .create_async()
            .await;

        let provider = provider_for(&server);
        let response = provider
            .execute(ExecuteRequest::new("hi"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(response.output, "hello");
        failures.assert_async().await;
        success.assert_async().await;
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .with_status(400)
            .with_body("bad request")
            .expect(1)
            .create_async()
            .await;

        let provider = provider_for(&server);
        let err = provider
            .execute(ExecuteRequest::new("hi"), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Api { status: 400, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rate_limit_maps_and_retries() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/messages")
            .with_status(429)
            .with_body("quota")
            .expect(4) // initial + 3 retries
            .create_async()
            .await;

        let provider = provider_for(&server);
        let err = provider
            .execute(ExecuteRequest::new("hi"), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::RateLimited(_)));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_no_api_key() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/messages")
            .with_status(401)
            .with_body("bad key")
            .create_async()
            .await;

        let provider = provider_for(&server);
        let err = provider
            .execute(ExecuteRequest::new("hi"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::NoApiKey(_)));
    }

    #[tokio::test]
    async fn test_cancel_short_circuits() {
        let server = mockito::Server::new_async().await;
        let provider = provider_for(&server);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = provider
            .execute(ExecuteRequest::new("hi"), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }

    #[test]
    fn test_validate_config_requires_key() {
        // No key in config; clear the env var influence by using a name
        // that is never set in CI is not possible, so only assert the
        // explicit-key path.
        let config = ApiProviderConfig::default().with_api_key("k");
        let provider = ApiProvider::new(config).unwrap();
        assert!(provider.validate_config().is_ok());
    }
}
