//! Ports: the traits the core is written against.
//!
//! Providers turn prompts into responses; the event sink is the
//! transport-facing contract for outbound events; the counter sink is a
//! fire-and-forget metrics hook.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::errors::ProviderResult;
use super::models::{
    ExecuteRequest, ExecuteResponse, ProviderCapabilities, TaskError, TaskProgress, TaskResult,
};

/// Callback invoked with each streamed text delta and the text accumulated
/// so far.
pub type StreamCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// A provider turns a prompt into a text response, optionally streaming.
///
/// Concrete shapes: in-process API client, one-shot CLI subprocess,
/// long-lived RPC subprocess, and the hybrid composite over two of them.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this provider can serve the given model name.
    fn supports(&self, model: &str) -> bool;

    fn capabilities(&self) -> ProviderCapabilities {
        ProviderCapabilities::default()
    }

    /// Cheap static validation of the provider's configuration.
    fn validate_config(&self) -> ProviderResult<()> {
        Ok(())
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    /// Execute a request. Implementations must honour `cancel` promptly.
    async fn execute(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
    ) -> ProviderResult<ExecuteResponse>;

    /// Streaming execution. The default delegates to [`Provider::execute`]
    /// without emitting deltas.
    async fn execute_streaming(
        &self,
        request: ExecuteRequest,
        cancel: CancellationToken,
        on_delta: StreamCallback,
    ) -> ProviderResult<ExecuteResponse> {
        let _ = on_delta;
        self.execute(request, cancel).await
    }

    /// Release held resources (subprocesses, connections) at bridge
    /// shutdown. Default is a no-op.
    async fn shutdown(&self) {}
}

impl std::fmt::Debug for dyn Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider").field("name", &self.name()).finish()
    }
}

/// The transport-facing send contract. Exactly these four operations; the
/// executor never sees the transport itself.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send_progress(&self, progress: TaskProgress) -> anyhow::Result<()>;
    async fn send_result(&self, result: TaskResult) -> anyhow::Result<()>;
    async fn send_error(&self, error: TaskError) -> anyhow::Result<()>;
    fn set_last_exec_id(&self, execution_id: &str);
}

/// Fire-and-forget metrics counters. Implementations never fail and never
/// block.
pub trait CounterSink: Send + Sync {
    fn incr(&self, name: &str);
}
