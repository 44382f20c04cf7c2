//! Shared test helpers.

use std::sync::Mutex;

use async_trait::async_trait;

use tether::domain::models::{TaskError, TaskProgress, TaskResult};
use tether::EventSink;

/// One recorded event: (kind, execution id).
pub type LoggedEvent = (&'static str, String);

/// Event sink that records everything for assertions.
#[derive(Default)]
pub struct RecordingSink {
    pub progress: Mutex<Vec<TaskProgress>>,
    pub results: Mutex<Vec<TaskResult>>,
    pub errors: Mutex<Vec<TaskError>>,
    pub log: Mutex<Vec<LoggedEvent>>,
    pub last_exec: Mutex<Option<String>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress_events(&self) -> Vec<TaskProgress> {
        self.progress.lock().unwrap().clone()
    }

    pub fn results(&self) -> Vec<TaskResult> {
        self.results.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<TaskError> {
        self.errors.lock().unwrap().clone()
    }

    /// All events in true emission order.
    pub fn event_log(&self) -> Vec<LoggedEvent> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn send_progress(&self, progress: TaskProgress) -> anyhow::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(("progress", progress.execution_id.clone()));
        self.progress.lock().unwrap().push(progress);
        Ok(())
    }

    async fn send_result(&self, result: TaskResult) -> anyhow::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(("result", result.execution_id.clone()));
        self.results.lock().unwrap().push(result);
        Ok(())
    }

    async fn send_error(&self, error: TaskError) -> anyhow::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(("error", error.execution_id.clone()));
        self.errors.lock().unwrap().push(error);
        Ok(())
    }

    fn set_last_exec_id(&self, execution_id: &str) {
        *self.last_exec.lock().unwrap() = Some(execution_id.to_string());
    }
}

/// Wait until `predicate` holds or the timeout elapses.
pub async fn wait_for(mut predicate: impl FnMut() -> bool, timeout_ms: u64) -> bool {
    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
    while std::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    predicate()
}
