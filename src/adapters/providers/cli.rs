//! One-shot CLI providers: claude, codex, and gemini binaries.
//!
//! Each call spawns a fresh subprocess with flavor-specific arguments and
//! parses the final `result` JSON from stdout. Streaming (claude only) uses
//! the stream-json output format and feeds `text_delta` events to the
//! caller line by line. When the run produced text but no `result` event, a
//! response is synthesised with estimated token counts.

use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::errors::{ProviderError, ProviderResult};
use crate::domain::models::{ExecuteRequest, ExecuteResponse, StopReason, TokenUsage};
use crate::domain::ports::{Provider, StreamCallback};

/// Which CLI binary this provider drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliFlavor {
    Claude,
    Codex,
    Gemini,
}

impl CliFlavor {
    pub const fn provider_name(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
        }
    }

    const fn model_prefixes(self) -> &'static [&'static str] {
        match self {
            Self::Claude => &["claude-"],
            Self::Codex => &["gpt-", "o4-"],
            Self::Gemini => &["gemini-"],
        }
    }
}

#[derive(Debug, Clone)]
pub struct CliProviderConfig {
    pub flavor: CliFlavor,
    pub binary_path: String,
    /// Approval mode forwarded to the codex CLI.
    pub approval_mode: String,
    pub extra_args: Vec<String>,
    /// Per-call timeout; None relies on the caller's deadline.
    pub exec_timeout_secs: Option<u64>,
}

impl CliProviderConfig {
    pub fn new(flavor: CliFlavor, binary_path: impl Into<String>) -> Self {
        Self {
            flavor,
            binary_path: binary_path.into(),
            approval_mode: "auto".to_string(),
            extra_args: Vec::new(),
            exec_timeout_secs: None,
        }
    }
}

/// One-shot subprocess provider.
pub struct CliProvider {
    config: CliProviderConfig,
}

impl CliProvider {
    pub fn new(config: CliProviderConfig) -> Self {
        Self { config }
    }

    pub fn claude(binary_path: impl Into<String>) -> Self {
        Self::new(CliProviderConfig::new(CliFlavor::Claude, binary_path))
    }

    pub fn codex(binary_path: impl Into<String>) -> Self {
        Self::new(CliProviderConfig::new(CliFlavor::Codex, binary_path))
    }

    pub fn gemini(binary_path: impl Into<String>) -> Self {
        Self::new(CliProviderConfig::new(CliFlavor::Gemini, binary_path))
    }

    /// Flavor-specific argv, without the binary itself.
    fn build_args(&self, request: &ExecuteRequest, streaming: bool) -> Vec<String> {
        let mut args = Vec::new();
        match self.config.flavor {
            CliFlavor::Claude => {
                args.push("--print".to_string());
                args.push("--output-format".to_string());
                if streaming {
                    args.push("stream-json".to_string());
                    // stream-json requires verbose output.
                    args.push("--verbose".to_string());
                } else {
                    args.push("json".to_string());
                }
                if !request.model.is_empty() {
                    args.push("--model".to_string());
                    args.push(request.model.clone());
                }
                if !request.system_prompt.is_empty() {
                    args.push("--system-prompt".to_string());
                    args.push(request.system_prompt.clone());
                }
                if !request.tools.is_empty() {
                    args.push("--allowedTools".to_string());
                    args.push(request.tools.join(","));
                }
            }
            CliFlavor::Codex => {
                args.push("--quiet".to_string());
                args.push("--output-format".to_string());
                args.push("json".to_string());
                if !request.model.is_empty() {
                    args.push("--model".to_string());
                    args.push(request.model.clone());
                }
                args.push("--approval-mode".to_string());
                args.push(self.config.approval_mode.clone());
            }
            CliFlavor::Gemini => {
                args.push("--output-format".to_string());
                args.push("json".to_string());
                if !request.model.is_empty() {
                    args.push("--model".to_string());
                    args.push(request.model.clone());
                }
            }
        }
        args.extend(self.config.extra_args.clone());
        args.push(request.prompt.clone());
        args
    }

    fn spawn(&self, request: &ExecuteRequest, args: &[String]) -> ProviderResult<tokio::process::Child> {
        let mut command = Command::new(&self.config.binary_path);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if !request.work_dir.is_empty() {
            command.current_dir(&request.work_dir);
        }

        match command.spawn() {
            Ok(child) => Ok(child),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound
                && self.config.flavor == CliFlavor::Gemini =>
            {
                // Gemini ships via npm; fall back to npx when the binary is
                // not installed.
                debug!("gemini binary missing; falling back to npx");
                let mut fallback = Command::new("npx");
                fallback
                    .arg("@google/gemini-cli")
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true);
                if !request.work_dir.is_empty() {
                    fallback.current_dir(&request.work_dir);
                }
                fallback
                    .spawn()
                    .map_err(|e| ProviderError::Unavailable(format!("npx fallback failed: {e}")))
            }
            Err(e) => Err(ProviderError::Unavailable(format!(
                "failed to spawn {}: {e}",
                self.config.binary_path
            ))),
        }
    }

    async fn run(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
        on_delta: Option<StreamCallback>,
    ) -> ProviderResult<ExecuteResponse> {
        let streaming = on_delta.is_some();
        let args = self.build_args(&request, streaming);
        let started = Instant::now();

        debug!(
            flavor = self.config.flavor.provider_name(),
            streaming,
            "Spawning CLI provider"
        );
        let mut child = self.spawn(&request, &args)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Internal("failed to capture stdout".into()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProviderError::Internal("failed to capture stderr".into()))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let read = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut accumulated = String::new();
            let mut result: Option<CliResult> = None;
            let mut raw_stdout = String::new();

            while let Ok(Some(line)) = lines.next_line().await {
                raw_stdout.push_str(&line);
                raw_stdout.push('\n');

                let Ok(event) = serde_json::from_str::<Value>(line.trim()) else {
                    continue;
                };
                if let Some(delta) = extract_text_delta(&event) {
                    accumulated.push_str(&delta);
                    if let Some(callback) = &on_delta {
                        callback(&delta, &accumulated);
                    }
                }
                if let Some(parsed) = parse_result_event(&event) {
                    result = Some(parsed);
                }
            }
            (accumulated, result, raw_stdout)
        };

        let deadline = self
            .config
            .exec_timeout_secs
            .map_or(Duration::MAX, Duration::from_secs);

        let (accumulated, mut result, raw_stdout) = tokio::select! {
            read = tokio::time::timeout(deadline, read) => match read {
                Ok(out) => out,
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(ProviderError::CliTimeout);
                }
            },
            () = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(ProviderError::Cancelled);
            }
        };

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            () = cancel.cancelled() => None,
        };
        let status = match waited {
            Some(status) => status.map_err(|e| ProviderError::Internal(e.to_string()))?,
            None => {
                let _ = child.kill().await;
                return Err(ProviderError::Cancelled);
            }
        };
        let stderr_output = stderr_task.await.unwrap_or_default();

        // Non-streaming runs may emit one JSON document instead of NDJSON.
        if result.is_none() {
            if let Ok(doc) = serde_json::from_str::<Value>(raw_stdout.trim()) {
                result = parse_result_event(&doc);
            }
        }

        if let Some(result) = result {
            if result.is_error {
                return Err(ProviderError::CliExecution {
                    exit_code: status.code(),
                    stderr: if stderr_output.is_empty() {
                        result.output
                    } else {
                        stderr_output
                    },
                });
            }
            return Ok(ExecuteResponse {
                output: if result.output.is_empty() {
                    accumulated
                } else {
                    result.output
                },
                token_usage: result.usage,
                duration_ms: if result.duration_ms > 0 {
                    result.duration_ms
                } else {
                    elapsed_ms(started)
                },
                model: request.model,
                stop_reason: StopReason::EndTurn,
                tool_calls: Vec::new(),
            });
        }

        // No result event: synthesise from accumulated text, or fail on a
        // non-zero exit.
        if !status.success() {
            return Err(ProviderError::CliExecution {
                exit_code: status.code(),
                stderr: stderr_output,
            });
        }
        if accumulated.is_empty() && raw_stdout.trim().is_empty() {
            return Err(ProviderError::InvalidResponse(
                "CLI produced no output".to_string(),
            ));
        }

        let output = if accumulated.is_empty() {
            raw_stdout.trim().to_string()
        } else {
            accumulated
        };
        warn!(
            flavor = self.config.flavor.provider_name(),
            "CLI exited without a result event; synthesising response"
        );
        Ok(ExecuteResponse {
            token_usage: estimate_usage(&output),
            duration_ms: elapsed_ms(started),
            model: request.model,
            stop_reason: StopReason::EndTurn,
            tool_calls: Vec::new(),
            output,
        })
    }
}

#[async_trait]
impl Provider for CliProvider {
    fn name(&self) -> &str {
        self.config.flavor.provider_name()
    }

    fn supports(&self, model: &str) -> bool {
        self.config
            .flavor
            .model_prefixes()
            .iter()
            .any(|p| model.starts_with(p))
    }

    fn validate_config(&self) -> ProviderResult<()> {
        if self.config.binary_path.is_empty() {
            return Err(ProviderError::InvalidConfig("binary path is empty".into()));
        }
        Ok(())
    }

    fn supports_streaming(&self) -> bool {
        self.config.flavor == CliFlavor::Claude
    }

    async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> ProviderResult<ExecuteResponse> {
        self.run(request, cancel, None).await
    }

    async fn execute_streaming(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
        on_delta: StreamCallback,
    ) -> ProviderResult<ExecuteResponse> {
        self.run(request, cancel, Some(on_delta)).await
    }
}

#[derive(Debug, Clone)]
struct CliResult {
    output: String,
    usage: TokenUsage,
    duration_ms: u64,
    is_error: bool,
}

/// Parse a `result`-typed event from any of the CLI dialects.
fn parse_result_event(event: &Value) -> Option<CliResult> {
    if event.get("type").and_then(Value::as_str) != Some("result") {
        return None;
    }
    let output = event
        .get("result")
        .or_else(|| event.get("output"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let usage = event.get("usage").map_or_else(TokenUsage::default, |u| {
        let input = u["input_tokens"].as_u64().unwrap_or(0);
        let output = u["output_tokens"].as_u64().unwrap_or(0);
        TokenUsage {
            input,
            output,
            total: input + output,
            cache_read: u["cache_read_input_tokens"].as_u64().unwrap_or(0),
            cache_creation: u["cache_creation_input_tokens"].as_u64().unwrap_or(0),
        }
    });
    Some(CliResult {
        output,
        usage,
        duration_ms: event["duration_ms"].as_u64().unwrap_or(0),
        is_error: event["is_error"].as_bool().unwrap_or(false),
    })
}

/// Extract streamed text from the NDJSON dialects we may encounter.
fn extract_text_delta(event: &Value) -> Option<String> {
    match event.get("type").and_then(Value::as_str)? {
        "text_delta" => event.get("text").and_then(Value::as_str).map(String::from),
        "content_block_delta" => event
            .pointer("/delta/text")
            .and_then(Value::as_str)
            .map(String::from),
        "assistant" => {
            // Whole-message events carry content blocks.
            let blocks = event.pointer("/message/content")?.as_array()?;
            let text: String = blocks
                .iter()
                .filter_map(|b| {
                    if b["type"].as_str() == Some("text") {
                        b["text"].as_str()
                    } else {
                        None
                    }
                })
                .collect();
            (!text.is_empty()).then_some(text)
        }
        _ => None,
    }
}

/// Rough token estimate when the CLI reported none: chars / 4.
fn estimate_usage(text: &str) -> TokenUsage {
    let estimated = u64::try_from(text.chars().count() / 4).unwrap_or(u64::MAX);
    TokenUsage::new(0, estimated)
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_claude_args_non_streaming() {
        let provider = CliProvider::claude("claude");
        let request = ExecuteRequest::new("do it").with_model("claude-sonnet-4");
        let args = provider.build_args(&request, false);

        assert!(args.contains(&"--print".to_string()));
        assert!(args.contains(&"json".to_string()));
        assert!(!args.contains(&"--verbose".to_string()));
        assert_eq!(args.last().unwrap(), "do it");
    }

    #[test]
    fn test_claude_args_streaming_requires_verbose() {
        let provider = CliProvider::claude("claude");
        let request = ExecuteRequest::new("do it");
        let args = provider.build_args(&request, true);

        assert!(args.contains(&"stream-json".to_string()));
        assert!(args.contains(&"--verbose".to_string()));
    }

    #[test]
    fn test_claude_args_tools() {
        let provider = CliProvider::claude("claude");
        let mut request = ExecuteRequest::new("p");
        request.tools = vec!["Edit".to_string(), "Bash".to_string()];
        let args = provider.build_args(&request, false);

        let idx = args.iter().position(|a| a == "--allowedTools").unwrap();
        assert_eq!(args[idx + 1], "Edit,Bash");
    }

    #[test]
    fn test_codex_args() {
        let provider = CliProvider::codex("codex");
        let request = ExecuteRequest::new("p").with_model("gpt-5-codex");
        let args = provider.build_args(&request, false);

        assert!(args.contains(&"--quiet".to_string()));
        assert!(args.contains(&"--approval-mode".to_string()));
        assert!(args.contains(&"gpt-5-codex".to_string()));
    }

    #[test]
    fn test_gemini_args() {
        let provider = CliProvider::gemini("gemini");
        let request = ExecuteRequest::new("p").with_model("gemini-2.5-pro");
        let args = provider.build_args(&request, false);

        assert_eq!(args[0], "--output-format");
        assert!(args.contains(&"gemini-2.5-pro".to_string()));
    }

    #[test]
    fn test_parse_result_event() {
        let event = json!({
            "type": "result",
            "result": "done",
            "duration_ms": 120,
            "usage": {"input_tokens": 7, "output_tokens": 13}
        });
        let result = parse_result_event(&event).unwrap();
        assert_eq!(result.output, "done");
        assert_eq!(result.usage.input, 7);
        assert_eq!(result.usage.total, 20);
        assert_eq!(result.duration_ms, 120);
        assert!(!result.is_error);

        assert!(parse_result_event(&json!({"type": "assistant"})).is_none());
    }

    #[test]
    fn test_extract_text_delta_dialects() {
        assert_eq!(
            extract_text_delta(&json!({"type": "text_delta", "text": "a"})).as_deref(),
            Some("a")
        );
        assert_eq!(
            extract_text_delta(
                &json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "b"}})
            )
            .as_deref(),
            Some("b")
        );
        assert_eq!(
            extract_text_delta(&json!({
                "type": "assistant",
                "message": {"content": [{"type": "text", "text": "c"}]}
            }))
            .as_deref(),
            Some("c")
        );
        assert!(extract_text_delta(&json!({"type": "system"})).is_none());
    }

    #[test]
    fn test_estimate_usage() {
        let usage = estimate_usage(&"x".repeat(40));
        assert_eq!(usage.output, 10);
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let provider = CliProvider::claude("definitely-not-a-real-binary");
        let err = provider
            .execute(ExecuteRequest::new("p"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_synthesised_response_from_plain_output() {
        // `echo` plays the CLI: no result event, exit 0, plain stdout.
        let provider = CliProvider::new(CliProviderConfig::new(CliFlavor::Claude, "echo"));
        let response = provider
            .execute(ExecuteRequest::new("hello world"), CancellationToken::new())
            .await
            .unwrap();
        assert!(response.output.contains("hello world"));
        assert!(response.token_usage.output > 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_without_result_is_cli_execution() {
        let provider = CliProvider::new(CliProviderConfig::new(CliFlavor::Claude, "false"));
        let err = provider
            .execute(ExecuteRequest::new("p"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::CliExecution { .. }));
    }
}
