//! Long-lived RPC subprocess provider (codex dialect).
//!
//! Spawns the CLI once and speaks line-delimited JSON-RPC 2.0 over its
//! stdin/stdout. Start performs the `initialize`/`initialized` handshake
//! and optional `account/login/start`; a monitor task watches for
//! unexpected child exits and restarts up to `max_restarts` times, after
//! which the provider is disabled permanently. Each execute opens a thread,
//! starts a turn, collects notifications until `turn/completed`, and
//! answers approval requests according to the configured policy.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::errors::{ProviderError, ProviderResult};
use crate::domain::models::{
    CodexRpcConfig, ExecuteRequest, ExecuteResponse, StopReason, TokenUsage, ToolCall,
};
use crate::domain::ports::{Provider, StreamCallback};
use crate::infrastructure::rpc::JsonRpcClient;

/// Wire method names. These are protocol constants.
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "initialized";
    pub const LOGIN_START: &str = "account/login/start";
    pub const THREAD_START: &str = "thread/start";
    pub const TURN_START: &str = "turn/start";
    pub const TURN_COMPLETED: &str = "turn/completed";
    pub const AGENT_MESSAGE_DELTA: &str = "item/agentMessage/delta";
    pub const COMMAND_OUTPUT_DELTA: &str = "item/commandExecution/outputDelta";
    pub const ITEM_COMPLETED: &str = "item/completed";
    pub const COMMAND_APPROVAL_REQUEST: &str = "item/commandExecution/requestApproval";
    pub const COMMAND_APPROVAL_RESPONSE: &str = "item/commandExecution/approvalResponse";
    pub const FILE_APPROVAL_REQUEST: &str = "item/fileChange/requestApproval";
    pub const FILE_APPROVAL_RESPONSE: &str = "item/fileChange/approvalResponse";
}

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_GRACE: Duration = Duration::from_secs(5);

/// How the provider answers approval requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalPolicy {
    AutoApprove,
    DenyAll,
}

impl ApprovalPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto-approve" => Some(Self::AutoApprove),
            "deny-all" => Some(Self::DenyAll),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AutoApprove => "auto-approve",
            Self::DenyAll => "deny-all",
        }
    }

    pub const fn decision(self) -> &'static str {
        match self {
            Self::AutoApprove => "accept",
            Self::DenyAll => "decline",
        }
    }
}

/// Authentication for `account/login/start`.
#[derive(Debug, Clone)]
pub enum RpcAuth {
    ApiKey(String),
    ChatGptAuthTokens(Value),
}

impl RpcAuth {
    fn params(&self) -> Value {
        match self {
            Self::ApiKey(key) => json!({"method": "apiKey", "apiKey": key}),
            Self::ChatGptAuthTokens(tokens) => {
                json!({"method": "chatgptAuthTokens", "chatgptAuthTokens": tokens})
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RpcProviderConfig {
    pub binary_path: String,
    pub args: Vec<String>,
    pub approval_policy: ApprovalPolicy,
    pub auth: Option<RpcAuth>,
    pub max_restarts: u32,
}

impl RpcProviderConfig {
    pub fn from_settings(settings: &CodexRpcConfig) -> ProviderResult<Self> {
        let approval_policy = ApprovalPolicy::parse(&settings.approval_policy).ok_or_else(|| {
            ProviderError::InvalidConfig(format!(
                "unknown approval policy {:?}",
                settings.approval_policy
            ))
        })?;
        let auth = settings
            .api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .map(RpcAuth::ApiKey);
        Ok(Self {
            binary_path: settings.binary_path.clone(),
            args: settings.args.clone(),
            approval_policy,
            auth,
            max_restarts: settings.max_restarts,
        })
    }
}

struct RpcCore {
    config: RpcProviderConfig,
    client: tokio::sync::Mutex<Option<Arc<JsonRpcClient>>>,
    child_pid: AtomicU32,
    exited: Mutex<Option<tokio::sync::watch::Receiver<bool>>>,
    running: AtomicBool,
    restarts: AtomicU32,
    disabled: AtomicBool,
}

impl RpcCore {
    fn new(config: RpcProviderConfig) -> Self {
        Self {
            config,
            client: tokio::sync::Mutex::new(None),
            child_pid: AtomicU32::new(0),
            exited: Mutex::new(None),
            running: AtomicBool::new(false),
            restarts: AtomicU32::new(0),
            disabled: AtomicBool::new(false),
        }
    }

    /// Boxed start so the monitor's restart path does not create a
    /// recursive future type.
    fn start_boxed(self: Arc<Self>) -> BoxFuture<'static, ProviderResult<()>> {
        Box::pin(async move { self.start().await })
    }

    async fn start(self: &Arc<Self>) -> ProviderResult<()> {
        if self.disabled.load(Ordering::SeqCst) {
            return Err(ProviderError::Unavailable(
                "rpc provider disabled after repeated crashes".to_string(),
            ));
        }

        info!(binary = %self.config.binary_path, "Starting RPC subprocess");
        let mut child = Command::new(&self.config.binary_path)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ProviderError::Unavailable(format!(
                    "failed to spawn {}: {e}",
                    self.config.binary_path
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::Internal("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Internal("failed to capture stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProviderError::Internal("failed to capture stderr".into()))?;

        self.child_pid.store(child.id().unwrap_or(0), Ordering::SeqCst);

        // Stderr logger.
        let binary = self.config.binary_path.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(binary = %binary, "rpc stderr: {line}");
            }
        });

        let client = Arc::new(JsonRpcClient::new(stdout, stdin));
        *self.client.lock().await = Some(client.clone());

        // Monitor: reap the child and restart on unexpected exit.
        let (exit_tx, exit_rx) = tokio::sync::watch::channel(false);
        *self.exited.lock().expect("exited lock poisoned") = Some(exit_rx);
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = exit_tx.send(true);
            if !core.running.load(Ordering::SeqCst) {
                return;
            }
            warn!(status = ?status, "RPC subprocess exited unexpectedly");
            let attempts = core.restarts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempts > core.config.max_restarts {
                error!(
                    attempts,
                    max_restarts = core.config.max_restarts,
                    "RPC subprocess exceeded restart limit; disabling provider"
                );
                core.disabled.store(true, Ordering::SeqCst);
                core.running.store(false, Ordering::SeqCst);
                return;
            }
            info!(attempts, "Restarting RPC subprocess");
            if let Err(e) = core.clone().start_boxed().await {
                error!(error = %e, "RPC subprocess restart failed");
                core.disabled.store(true, Ordering::SeqCst);
                core.running.store(false, Ordering::SeqCst);
            }
        });

        // Handshake, bounded by the handshake timeout. A failed start must
        // not leave the child behind.
        let handshake_cancel_token = CancellationToken::new();
        let handshake = client.call(
            methods::INITIALIZE,
            Some(json!({"clientInfo": {"name": "tether", "version": env!("CARGO_PKG_VERSION")}})),
            &handshake_cancel_token,
        );
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await {
            Err(_) => {
                self.kill_child();
                return Err(ProviderError::HandshakeTimeout);
            }
            Ok(Err(e)) => {
                self.kill_child();
                return Err(e.into());
            }
            Ok(Ok(_)) => {}
        }
        if let Err(e) = client.notify(methods::INITIALIZED, None).await {
            self.kill_child();
            return Err(e.into());
        }

        if let Some(auth) = &self.config.auth {
            if let Err(e) = client
                .call(methods::LOGIN_START, Some(auth.params()), &CancellationToken::new())
                .await
            {
                self.kill_child();
                return Err(e.into());
            }
        }

        self.running.store(true, Ordering::SeqCst);
        info!("RPC subprocess ready");
        Ok(())
    }

    /// Hard-kill the child after a failed start.
    fn kill_child(&self) {
        let pid = self.child_pid.swap(0, Ordering::SeqCst);
        if pid == 0 {
            return;
        }
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(i32::try_from(pid).unwrap_or_default()), Signal::SIGKILL);
        }
    }

    async fn ensure_started(self: &Arc<Self>) -> ProviderResult<Arc<JsonRpcClient>> {
        if !self.running.load(Ordering::SeqCst) {
            self.start().await?;
        }
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| ProviderError::Unavailable("rpc client not started".into()))
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping RPC subprocess");

        if let Some(client) = self.client.lock().await.take() {
            client.close().await;
        }

        let pid = self.child_pid.swap(0, Ordering::SeqCst);
        if pid == 0 {
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            let _ = kill(Pid::from_raw(i32::try_from(pid).unwrap_or_default()), Signal::SIGTERM);
        }

        let exit_rx = self.exited.lock().expect("exited lock poisoned").clone();
        let exited = async {
            if let Some(mut rx) = exit_rx {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            }
        };

        if tokio::time::timeout(STOP_GRACE, exited).await.is_err() {
            warn!(pid, "RPC subprocess ignored SIGTERM; killing");
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;
                let _ = kill(Pid::from_raw(i32::try_from(pid).unwrap_or_default()), Signal::SIGKILL);
            }
        }
    }
}

/// RPC subprocess provider.
pub struct RpcProvider {
    core: Arc<RpcCore>,
}

impl RpcProvider {
    pub fn new(config: RpcProviderConfig) -> Self {
        Self {
            core: Arc::new(RpcCore::new(config)),
        }
    }

    pub fn from_settings(settings: &CodexRpcConfig) -> ProviderResult<Self> {
        Ok(Self::new(RpcProviderConfig::from_settings(settings)?))
    }

    /// Stop the subprocess: SIGTERM, grace period, SIGKILL.
    pub async fn stop(&self) {
        self.core.stop().await;
    }
}

#[async_trait]
impl Provider for RpcProvider {
    fn name(&self) -> &str {
        "codex"
    }

    fn supports(&self, model: &str) -> bool {
        model.starts_with("gpt-") || model.starts_with("o4-")
    }

    fn validate_config(&self) -> ProviderResult<()> {
        if self.core.config.binary_path.is_empty() {
            return Err(ProviderError::InvalidConfig("binary path is empty".into()));
        }
        Ok(())
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> ProviderResult<ExecuteResponse> {
        let client = self.core.ensure_started().await?;
        run_turn(
            &client,
            self.core.config.approval_policy,
            &request,
            &cancel,
            None,
        )
        .await
    }

    async fn execute_streaming(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
        on_delta: StreamCallback,
    ) -> ProviderResult<ExecuteResponse> {
        let client = self.core.ensure_started().await?;
        run_turn(
            &client,
            self.core.config.approval_policy,
            &request,
            &cancel,
            Some(on_delta),
        )
        .await
    }

    async fn shutdown(&self) {
        self.core.stop().await;
    }
}

#[derive(Default)]
struct TurnState {
    output: String,
    tool_calls: Vec<ToolCall>,
    /// Incremental command output keyed by item id, folded into the
    /// matching `item/completed` when its data carries no output.
    command_output: std::collections::HashMap<String, String>,
}

/// Run one thread/turn cycle over an established client.
///
/// Public so the session protocol can be exercised against a scripted
/// server without a real subprocess.
pub async fn run_turn(
    client: &Arc<JsonRpcClient>,
    approval_policy: ApprovalPolicy,
    request: &ExecuteRequest,
    cancel: &CancellationToken,
    on_delta: Option<StreamCallback>,
) -> ProviderResult<ExecuteResponse> {
    let started = Instant::now();

    let cwd = if request.work_dir.is_empty() {
        ".".to_string()
    } else {
        request.work_dir.clone()
    };
    let thread = client
        .call(
            methods::THREAD_START,
            Some(json!({
                "model": request.model,
                "cwd": cwd,
                "approvalPolicy": approval_policy.as_str(),
            })),
            cancel,
        )
        .await
        .map_err(ProviderError::from)?;
    let thread_id = thread["threadId"]
        .as_str()
        .ok_or_else(|| ProviderError::InvalidResponse("thread/start missing threadId".into()))?
        .to_string();

    let state = Arc::new(Mutex::new(TurnState::default()));
    let completed = Arc::new(tokio::sync::Notify::new());

    register_turn_handlers(client, approval_policy, &state, &completed, &on_delta);

    let turn_started = client
        .call(
            methods::TURN_START,
            Some(json!({
                "threadId": thread_id,
                "input": [{"type": "text", "text": request.prompt}],
            })),
            cancel,
        )
        .await;
    if let Err(e) = turn_started {
        remove_turn_handlers(client);
        return Err(e.into());
    }

    let outcome = tokio::select! {
        () = completed.notified() => Ok(()),
        () = cancel.cancelled() => Err(ProviderError::Cancelled),
    };
    remove_turn_handlers(client);
    outcome?;

    let state = state.lock().expect("turn state poisoned");
    debug!(
        thread_id = %thread_id,
        output_chars = state.output.len(),
        tool_calls = state.tool_calls.len(),
        "Turn completed"
    );
    Ok(ExecuteResponse {
        output: state.output.clone(),
        token_usage: TokenUsage::new(0, u64::try_from(state.output.chars().count() / 4).unwrap_or(0)),
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(0),
        model: request.model.clone(),
        stop_reason: StopReason::EndTurn,
        tool_calls: state.tool_calls.clone(),
    })
}

fn register_turn_handlers(
    client: &Arc<JsonRpcClient>,
    approval_policy: ApprovalPolicy,
    state: &Arc<Mutex<TurnState>>,
    completed: &Arc<tokio::sync::Notify>,
    on_delta: &Option<StreamCallback>,
) {
    // agentMessage deltas: both payload dialects (`delta` and `text`) are
    // accepted; `delta` wins if both appear.
    {
        let state = state.clone();
        let on_delta = on_delta.clone();
        client.on_notification(
            methods::AGENT_MESSAGE_DELTA,
            Arc::new(move |params: Value| {
                let delta = params["delta"]
                    .as_str()
                    .or_else(|| params["text"].as_str())
                    .unwrap_or_default()
                    .to_string();
                if delta.is_empty() {
                    return;
                }
                let accumulated = {
                    let mut state = state.lock().expect("turn state poisoned");
                    state.output.push_str(&delta);
                    state.output.clone()
                };
                if let Some(callback) = &on_delta {
                    callback(&delta, &accumulated);
                }
            }),
        );
    }

    {
        let state = state.clone();
        client.on_notification(
            methods::COMMAND_OUTPUT_DELTA,
            Arc::new(move |params: Value| {
                let item_id = params["itemId"].as_str().unwrap_or_default().to_string();
                let delta = params["delta"]
                    .as_str()
                    .or_else(|| params["output"].as_str())
                    .unwrap_or_default();
                if item_id.is_empty() || delta.is_empty() {
                    return;
                }
                state
                    .lock()
                    .expect("turn state poisoned")
                    .command_output
                    .entry(item_id)
                    .or_default()
                    .push_str(delta);
            }),
        );
    }

    {
        let state = state.clone();
        client.on_notification(
            methods::ITEM_COMPLETED,
            Arc::new(move |params: Value| {
                if let Some(mut call) = parse_completed_item(&params) {
                    let mut state = state.lock().expect("turn state poisoned");
                    if call.output.is_none() {
                        let item_id = params["itemId"].as_str().unwrap_or_default();
                        call.output = state.command_output.remove(item_id);
                    }
                    state.tool_calls.push(call);
                }
            }),
        );
    }

    for (request_method, response_method) in [
        (methods::COMMAND_APPROVAL_REQUEST, methods::COMMAND_APPROVAL_RESPONSE),
        (methods::FILE_APPROVAL_REQUEST, methods::FILE_APPROVAL_RESPONSE),
    ] {
        let reply_client = client.clone();
        client.on_notification(
            request_method,
            Arc::new(move |params: Value| {
                let reply = json!({
                    "threadId": params["threadId"],
                    "itemId": params["itemId"],
                    "decision": approval_policy.decision(),
                });
                let client = reply_client.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.notify(response_method, Some(reply)).await {
                        warn!(error = %e, method = response_method, "Failed to send approval response");
                    }
                });
            }),
        );
    }

    {
        let completed = completed.clone();
        client.on_notification(
            methods::TURN_COMPLETED,
            Arc::new(move |_params: Value| {
                completed.notify_one();
            }),
        );
    }
}

fn remove_turn_handlers(client: &Arc<JsonRpcClient>) {
    for method in [
        methods::AGENT_MESSAGE_DELTA,
        methods::COMMAND_OUTPUT_DELTA,
        methods::ITEM_COMPLETED,
        methods::COMMAND_APPROVAL_REQUEST,
        methods::FILE_APPROVAL_REQUEST,
        methods::TURN_COMPLETED,
    ] {
        client.remove_notification_handler(method);
    }
}

/// Map an `item/completed` notification to a tool call. Unknown item types
/// are logged and ignored for forward compatibility.
fn parse_completed_item(params: &Value) -> Option<ToolCall> {
    let item_type = params["itemType"].as_str().unwrap_or_default();
    let data = &params["data"];
    match item_type {
        "commandExecution" => {
            let command = data["command"].as_str().unwrap_or_default().to_string();
            Some(ToolCall {
                name: command.clone(),
                input: json!({"command": command}),
                output: data["output"].as_str().map(String::from),
                exit_code: data["exitCode"]
                    .as_i64()
                    .and_then(|c| i32::try_from(c).ok()),
            })
        }
        "mcpToolCall" => Some(ToolCall {
            name: data["toolName"].as_str().unwrap_or_default().to_string(),
            input: data["input"].clone(),
            output: None,
            exit_code: None,
        }),
        other => {
            debug!(item_type = %other, "Ignoring unknown completed item type");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approval_policy_parsing() {
        assert_eq!(
            ApprovalPolicy::parse("auto-approve"),
            Some(ApprovalPolicy::AutoApprove)
        );
        assert_eq!(ApprovalPolicy::parse("deny-all"), Some(ApprovalPolicy::DenyAll));
        assert_eq!(ApprovalPolicy::parse("whatever"), None);
        assert_eq!(ApprovalPolicy::AutoApprove.decision(), "accept");
        assert_eq!(ApprovalPolicy::DenyAll.decision(), "decline");
    }

    #[test]
    fn test_auth_params_shape() {
        let key = RpcAuth::ApiKey("sk-test".to_string());
        assert_eq!(
            key.params(),
            json!({"method": "apiKey", "apiKey": "sk-test"})
        );

        let tokens = RpcAuth::ChatGptAuthTokens(json!({"access": "a"}));
        assert_eq!(
            tokens.params(),
            json!({"method": "chatgptAuthTokens", "chatgptAuthTokens": {"access": "a"}})
        );
    }

    #[test]
    fn test_parse_completed_command_execution() {
        let params = json!({
            "threadId": "t1",
            "itemId": "i1",
            "itemType": "commandExecution",
            "data": {"command": "cargo test", "exitCode": 0, "output": "ok"}
        });
        let call = parse_completed_item(&params).unwrap();
        assert_eq!(call.name, "cargo test");
        assert_eq!(call.exit_code, Some(0));
        assert_eq!(call.output.as_deref(), Some("ok"));
    }

    #[test]
    fn test_parse_completed_mcp_tool_call() {
        let params = json!({
            "itemType": "mcpToolCall",
            "data": {"toolName": "search", "input": {"q": "x"}}
        });
        let call = parse_completed_item(&params).unwrap();
        assert_eq!(call.name, "search");
        assert_eq!(call.input, json!({"q": "x"}));
    }

    #[test]
    fn test_parse_completed_unknown_type_ignored() {
        let params = json!({"itemType": "reasoning", "data": {}});
        assert!(parse_completed_item(&params).is_none());
    }

    #[test]
    fn test_config_rejects_unknown_policy() {
        let settings = CodexRpcConfig {
            approval_policy: "yolo".to_string(),
            ..CodexRpcConfig::default()
        };
        assert!(matches!(
            RpcProviderConfig::from_settings(&settings),
            Err(ProviderError::InvalidConfig(_))
        ));
    }
}
