//! Bridge service: wires the queue, executor, registry, sandbox, and QA
//! pipeline together and dispatches inbound requests from the transport.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::adapters::providers::{build_registry, ProviderRegistry};
use crate::domain::models::{Config, ErrorCode, QaRequest, TaskError, TaskRequest, TaskResult};
use crate::domain::ports::{CounterSink, EventSink};
use crate::infrastructure::qa::QaPipeline;
use crate::infrastructure::sandbox::Sandbox;
use crate::infrastructure::security::CommandChecker;
use crate::services::executor::ExecutorConfig;
use crate::services::{TaskExecutor, TaskQueue};
use tokio_util::sync::CancellationToken;

/// A request arriving over the established duplex channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundRequest {
    Task(TaskRequest),
    Qa(QaRequest),
}

/// Long-running bridge instance.
pub struct Bridge {
    executor: Arc<TaskExecutor>,
    registry: Arc<ProviderRegistry>,
    qa: Arc<QaPipeline>,
    events: Arc<dyn EventSink>,
    qa_lock: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
}

impl Bridge {
    /// Build everything from configuration.
    pub fn from_config(
        config: &Config,
        events: Arc<dyn EventSink>,
        counters: Arc<dyn CounterSink>,
    ) -> Result<Self> {
        let registry =
            Arc::new(build_registry(&config.providers).context("failed to build providers")?);

        let sandbox = config
            .sandbox
            .enabled
            .then(|| Arc::new(Sandbox::new(&config.sandbox)));

        let queue = Arc::new(TaskQueue::new(config.queue_capacity));
        let executor = Arc::new(TaskExecutor::with_config(
            queue,
            registry.clone(),
            sandbox,
            events.clone(),
            counters,
            ExecutorConfig {
                default_timeout: std::time::Duration::from_secs(config.default_timeout_secs),
                ..ExecutorConfig::default()
            },
        ));

        let mut qa = QaPipeline::new();
        if config.security.check_commands {
            qa = qa.with_command_checker(CommandChecker::new(&config.security));
        }

        Ok(Self {
            executor,
            registry,
            qa: Arc::new(qa),
            events,
            qa_lock: tokio::sync::Mutex::new(()),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn start(&self) {
        self.executor.start();
        info!("Bridge started");
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.executor.stop().await;
        for provider in self.registry.providers() {
            provider.shutdown().await;
        }
        info!("Bridge stopped");
    }

    /// Route one inbound request. Task requests enqueue; QA requests run
    /// the pipeline directly, bypassing the AI provider path.
    pub async fn dispatch(&self, request: InboundRequest) {
        match request {
            InboundRequest::Task(task) => {
                let execution_id = task.execution_id.clone();
                if let Err(e) = self.executor.submit(task) {
                    warn!(execution_id = %execution_id, error = %e, "Task submission rejected");
                    let event = TaskError {
                        execution_id,
                        code: ErrorCode::InternalError,
                        message: e.to_string(),
                        retryable: true,
                    };
                    if let Err(send_err) = self.events.send_error(event).await {
                        error!(error = %send_err, "Failed to send submission error");
                    }
                }
            }
            InboundRequest::Qa(request) => self.run_qa(request).await,
        }
    }

    /// Run a QA request and deliver its result through the send interface.
    /// The result payload travels as a serialized body in a task result,
    /// with the exit code mirroring overall success.
    pub async fn run_qa(&self, request: QaRequest) {
        let _serial = self.qa_lock.lock().await;
        let execution_id = request.execution_id.clone();
        self.events.set_last_exec_id(&execution_id);

        let result = self.qa.run(&request, &self.shutdown).await;
        info!(
            execution_id = %execution_id,
            success = result.success,
            stages = result.stages.len(),
            "QA pipeline finished"
        );

        let exit_code = i32::from(!result.success);
        let duration_ms = result.duration_ms;
        let body = match serde_json::to_string(&result) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Failed to serialize QA result");
                format!("{{\"success\":{}}}", result.success)
            }
        };

        let event = TaskResult {
            execution_id,
            output: body,
            exit_code,
            duration_ms,
            token_usage: None,
        };
        if let Err(e) = self.events.send_result(event).await {
            error!(error = %e, "Failed to send QA result");
        }
    }
}
