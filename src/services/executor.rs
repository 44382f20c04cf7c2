//! Task executor: owns the queue, resolves providers, enforces the sandbox,
//! and turns each task into exactly one result or error event.
//!
//! One task runs at a time. The loop task pulls FIFO from the queue; each
//! execution registers a single running-task record (id, start time, cancel
//! handle) that is cleared on every exit path. Progress events for one
//! execution id are monotone non-decreasing.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::providers::registry::ProviderRegistry;
use crate::domain::errors::ProviderError;
use crate::domain::models::{
    ErrorCode, ExecuteRequest, TaskError, TaskProgress, TaskRequest, TaskResult,
};
use crate::domain::ports::{CounterSink, EventSink, StreamCallback};
use crate::infrastructure::sandbox::Sandbox;

use super::accumulator::StreamAccumulator;
use super::task_queue::{QueueError, TaskQueue};

/// Default per-task timeout when the request carries none.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(600);
/// Heartbeat interval for the progress ticker.
const PROGRESS_TICK_INTERVAL: Duration = Duration::from_secs(5);
/// Interval at which the streaming path drains the accumulator.
const STREAM_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("executor is not running")]
    NotRunning,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Tunables; defaults match production behavior, tests shrink them.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub default_timeout: Duration,
    pub progress_tick_interval: Duration,
    pub stream_flush_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TASK_TIMEOUT,
            progress_tick_interval: PROGRESS_TICK_INTERVAL,
            stream_flush_interval: STREAM_FLUSH_INTERVAL,
        }
    }
}

/// The single-slot record of the currently executing task.
#[derive(Debug, Clone)]
struct RunningTask {
    execution_id: String,
    started_at: Instant,
    cancel: CancellationToken,
}

/// Clamps progress emission to non-decreasing values per execution.
struct ProgressGate {
    events: Arc<dyn EventSink>,
    execution_id: String,
    last: AtomicU8,
}

impl ProgressGate {
    fn new(events: Arc<dyn EventSink>, execution_id: &str) -> Self {
        Self {
            events,
            execution_id: execution_id.to_string(),
            last: AtomicU8::new(0),
        }
    }

    async fn send(&self, mut progress: TaskProgress) {
        let floor = self.last.fetch_max(progress.progress, Ordering::SeqCst);
        progress.progress = progress.progress.max(floor);
        if let Err(e) = self.events.send_progress(progress).await {
            warn!(execution_id = %self.execution_id, error = %e, "Failed to send progress event");
        }
    }
}

/// Single-task executor with a FIFO queue and cooperative shutdown.
pub struct TaskExecutor {
    queue: Arc<TaskQueue>,
    registry: Arc<ProviderRegistry>,
    sandbox: Option<Arc<Sandbox>>,
    events: Arc<dyn EventSink>,
    counters: Arc<dyn CounterSink>,
    config: ExecutorConfig,
    running: AtomicBool,
    shutdown: CancellationToken,
    current: Mutex<Option<RunningTask>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl TaskExecutor {
    pub fn new(
        queue: Arc<TaskQueue>,
        registry: Arc<ProviderRegistry>,
        sandbox: Option<Arc<Sandbox>>,
        events: Arc<dyn EventSink>,
        counters: Arc<dyn CounterSink>,
    ) -> Self {
        Self::with_config(
            queue,
            registry,
            sandbox,
            events,
            counters,
            ExecutorConfig::default(),
        )
    }

    pub fn with_config(
        queue: Arc<TaskQueue>,
        registry: Arc<ProviderRegistry>,
        sandbox: Option<Arc<Sandbox>>,
        events: Arc<dyn EventSink>,
        counters: Arc<dyn CounterSink>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            queue,
            registry,
            sandbox,
            events,
            counters,
            config,
            running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            current: Mutex::new(None),
            loop_handle: Mutex::new(None),
        }
    }

    /// Start the loop task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Starting task executor");
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run_loop().await });
        *self.loop_handle.lock().expect("executor lock poisoned") = Some(handle);
    }

    /// Stop: cancel the current task, wake the queue, join the loop.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping task executor");
        self.cancel_current();
        self.shutdown.cancel();
        self.queue.wakeup();

        let handle = self
            .loop_handle
            .lock()
            .expect("executor lock poisoned")
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Executor loop task panicked");
            }
        }
    }

    /// Enqueue a task; fails when the executor is not running or the queue
    /// is full.
    pub fn submit(&self, task: TaskRequest) -> Result<(), ExecutorError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ExecutorError::NotRunning);
        }
        match self.queue.add(task) {
            Ok(()) => {
                self.counters.incr("tasks_submitted");
                Ok(())
            }
            Err(e) => {
                self.counters.incr("queue_rejected");
                Err(e.into())
            }
        }
    }

    pub fn is_executing(&self) -> bool {
        self.current
            .lock()
            .expect("executor lock poisoned")
            .is_some()
    }

    pub fn current_execution_id(&self) -> Option<String> {
        self.current
            .lock()
            .expect("executor lock poisoned")
            .as_ref()
            .map(|r| r.execution_id.clone())
    }

    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    /// Cancel the running task's context. No-op when idle.
    pub fn cancel_current(&self) {
        let current = self.current.lock().expect("executor lock poisoned");
        if let Some(record) = current.as_ref() {
            info!(execution_id = %record.execution_id, "Cancelling current task");
            record.cancel.cancel();
        }
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.queue.get_blocking(&self.shutdown).await {
                Ok(task) => self.execute_task(task).await,
                Err(QueueError::Interrupted) => {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Transient queue error in executor loop");
                }
            }
        }
        debug!("Executor loop exited");
    }

    /// Run one task and emit exactly one result or error event. Transport
    /// failures are logged, never re-raised: the loop survives them.
    async fn execute_task(&self, task: TaskRequest) {
        let execution_id = task.execution_id.clone();
        self.events.set_last_exec_id(&execution_id);
        self.counters.incr("tasks_started");

        let start = TaskProgress::status(&execution_id, 0, "task started");
        if let Err(e) = self.events.send_progress(start).await {
            warn!(execution_id = %execution_id, error = %e, "Failed to send start progress");
        }

        match self.execute(&task).await {
            Ok(result) => {
                let done = TaskProgress::status(&execution_id, 100, "task complete");
                if let Err(e) = self.events.send_progress(done).await {
                    warn!(execution_id = %execution_id, error = %e, "Failed to send completion progress");
                }
                self.counters.incr("tasks_completed");
                if let Err(e) = self.events.send_result(result).await {
                    error!(execution_id = %execution_id, error = %e, "Failed to send result event");
                }
            }
            Err(task_error) => {
                self.counters.incr("tasks_failed");
                if let Err(e) = self.events.send_error(task_error).await {
                    error!(execution_id = %execution_id, error = %e, "Failed to send error event");
                }
            }
        }
    }

    /// The synchronous single-task path, usable directly by tests and QA
    /// callers. Registers the running-task record on entry and clears it on
    /// every exit path.
    pub async fn execute(&self, task: &TaskRequest) -> Result<TaskResult, TaskError> {
        let cancel = CancellationToken::new();
        {
            let mut current = self.current.lock().expect("executor lock poisoned");
            *current = Some(RunningTask {
                execution_id: task.execution_id.clone(),
                started_at: Instant::now(),
                cancel: cancel.clone(),
            });
        }

        let result = self.execute_inner(task, &cancel).await;

        // Tear down ticker/flusher tasks and the record, on all paths.
        cancel.cancel();
        *self.current.lock().expect("executor lock poisoned") = None;

        result
    }

    async fn execute_inner(
        &self,
        task: &TaskRequest,
        cancel: &CancellationToken,
    ) -> Result<TaskResult, TaskError> {
        let execution_id = &task.execution_id;
        let started_at = self
            .current
            .lock()
            .expect("executor lock poisoned")
            .as_ref()
            .map_or_else(Instant::now, |r| r.started_at);

        let timeout = if task.timeout_seconds > 0 {
            Duration::from_secs(task.timeout_seconds.unsigned_abs())
        } else {
            self.config.default_timeout
        };

        if let Some(sandbox) = &self.sandbox {
            if let Err(e) = sandbox.validate_work_dir(&task.work_dir) {
                warn!(execution_id = %execution_id, error = %e, "Sandbox rejected work dir");
                return Err(TaskError {
                    execution_id: execution_id.clone(),
                    code: ErrorCode::SandboxViolation,
                    message: e.to_string(),
                    retryable: false,
                });
            }
        }

        let provider = self
            .registry
            .get_for_task(&task.provider, &task.model)
            .map_err(|e| e.to_task_error(execution_id))?;

        debug!(
            execution_id = %execution_id,
            provider = %provider.name(),
            model = %task.model,
            timeout_secs = timeout.as_secs(),
            "Dispatching task to provider"
        );

        let gate = Arc::new(ProgressGate::new(self.events.clone(), execution_id));
        self.spawn_progress_ticker(gate.clone(), cancel.child_token());

        let request = ExecuteRequest {
            prompt: task.prompt.clone(),
            model: task.model.clone(),
            max_tokens: task.max_tokens,
            tools: task.tools.clone(),
            work_dir: task.work_dir.clone(),
            system_prompt: String::new(),
        };

        let call = if provider.supports_streaming() {
            self.streaming_call(provider.clone(), request, cancel, gate.clone())
        } else {
            let cancel = cancel.clone();
            Box::pin(async move { provider.execute(request, cancel).await })
        };

        let outcome = tokio::time::timeout(timeout, call).await;
        let duration_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);

        match outcome {
            Err(_elapsed) => {
                cancel.cancel();
                Err(TaskError {
                    execution_id: execution_id.clone(),
                    code: ErrorCode::Timeout,
                    message: format!("task exceeded {}s timeout", timeout.as_secs()),
                    retryable: true,
                })
            }
            Ok(Err(provider_error)) => {
                Err(classify(execution_id, &provider_error, cancel.is_cancelled()))
            }
            Ok(Ok(response)) => Ok(TaskResult {
                execution_id: execution_id.clone(),
                output: response.output,
                exit_code: 0,
                duration_ms: if response.duration_ms > 0 {
                    response.duration_ms
                } else {
                    duration_ms
                },
                token_usage: Some(response.token_usage),
            }),
        }
    }

    /// Heartbeat: 10%, then +5% per tick, capped at 90%.
    fn spawn_progress_ticker(&self, gate: Arc<ProgressGate>, done: CancellationToken) {
        let tick = self.config.progress_tick_interval;
        tokio::spawn(async move {
            let mut progress: u8 = 10;
            let mut interval = tokio::time::interval(tick);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = done.cancelled() => break,
                    _ = interval.tick() => {
                        let event =
                            TaskProgress::status(&gate.execution_id, progress, "executing...");
                        gate.send(event).await;
                        progress = (progress + 5).min(90);
                    }
                }
            }
        });
    }

    /// Streaming execution: deltas feed the accumulator; a single flusher
    /// task drains coalesced chunks in order, on add-notification or on the
    /// flush tick, and a terminal flush runs after the provider returns.
    fn streaming_call(
        &self,
        provider: Arc<dyn crate::domain::ports::Provider>,
        request: ExecuteRequest,
        cancel: &CancellationToken,
        gate: Arc<ProgressGate>,
    ) -> BoxFuture<'static, Result<crate::domain::models::ExecuteResponse, ProviderError>> {
        let accumulator = Arc::new(StreamAccumulator::new());
        let added = Arc::new(tokio::sync::Notify::new());
        let flush_interval = self.config.stream_flush_interval;
        let cancel = cancel.clone();
        let flush_done = CancellationToken::new();

        let flusher = {
            let accumulator = accumulator.clone();
            let added = added.clone();
            let gate = gate.clone();
            let done = flush_done.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(flush_interval);
                loop {
                    tokio::select! {
                        () = done.cancelled() => break,
                        () = added.notified() => {}
                        _ = interval.tick() => {}
                    }
                    while accumulator.should_flush() {
                        if let Some(chunk) = accumulator.flush() {
                            let event = TaskProgress::text(
                                &gate.execution_id,
                                chunk,
                                accumulator.get_accumulated(),
                            );
                            gate.send(event).await;
                        }
                    }
                }
            })
        };

        let callback: StreamCallback = {
            let accumulator = accumulator.clone();
            let added = added.clone();
            Arc::new(move |delta: &str, _accumulated: &str| {
                accumulator.add(delta);
                added.notify_one();
            })
        };

        Box::pin(async move {
            let result = provider
                .execute_streaming(request, cancel.clone(), callback)
                .await;

            // Stop the flusher before the terminal flush so the final chunk
            // cannot interleave. The flusher finishes any in-flight send
            // before it observes the token.
            flush_done.cancel();
            let _ = flusher.await;
            if let Some(chunk) = accumulator.flush_all() {
                let event =
                    TaskProgress::text(&gate.execution_id, chunk, accumulator.get_accumulated());
                gate.send(event).await;
            }
            result
        })
    }
}

/// Map a provider error to the transport taxonomy, consulting the
/// cancellation state first.
fn classify(execution_id: &str, error: &ProviderError, cancelled: bool) -> TaskError {
    if cancelled && !matches!(error, ProviderError::Timeout | ProviderError::CliTimeout) {
        return TaskError {
            execution_id: execution_id.to_string(),
            code: ErrorCode::Cancelled,
            message: "task cancelled".to_string(),
            retryable: false,
        };
    }
    error.to_task_error(execution_id)
}
