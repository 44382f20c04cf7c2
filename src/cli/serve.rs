//! Stdio transport shim.
//!
//! The bridge core consumes an already-established duplex channel; this
//! shim provides one over stdin/stdout: one JSON request per inbound line,
//! one JSON event envelope per outbound line.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use crate::application::{Bridge, InboundRequest};
use crate::domain::models::{TaskError, TaskProgress, TaskResult};
use crate::domain::ports::EventSink;

/// Outbound event envelope.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Outbound<'a> {
    event: &'static str,
    ts: String,
    #[serde(flatten)]
    payload: Payload<'a>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Payload<'a> {
    Progress(&'a TaskProgress),
    Result(&'a TaskResult),
    Error(&'a TaskError),
}

impl<'a> Outbound<'a> {
    fn new(event: &'static str, payload: Payload<'a>) -> Self {
        Self {
            event,
            ts: chrono::Utc::now().to_rfc3339(),
            payload,
        }
    }
}

/// Event sink that writes JSON lines to stdout.
pub struct StdioEventSink {
    stdout: tokio::sync::Mutex<tokio::io::Stdout>,
    last_exec_id: Mutex<String>,
}

impl StdioEventSink {
    pub fn new() -> Self {
        Self {
            stdout: tokio::sync::Mutex::new(tokio::io::stdout()),
            last_exec_id: Mutex::new(String::new()),
        }
    }

    pub fn last_exec_id(&self) -> String {
        self.last_exec_id.lock().expect("sink lock poisoned").clone()
    }

    async fn write_event(&self, event: &Outbound<'_>) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let mut stdout = self.stdout.lock().await;
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
        Ok(())
    }
}

impl Default for StdioEventSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSink for StdioEventSink {
    async fn send_progress(&self, progress: TaskProgress) -> Result<()> {
        self.write_event(&Outbound::new("progress", Payload::Progress(&progress)))
            .await
    }

    async fn send_result(&self, result: TaskResult) -> Result<()> {
        self.write_event(&Outbound::new("result", Payload::Result(&result)))
            .await
    }

    async fn send_error(&self, error: TaskError) -> Result<()> {
        self.write_event(&Outbound::new("error", Payload::Error(&error)))
            .await
    }

    fn set_last_exec_id(&self, execution_id: &str) {
        *self.last_exec_id.lock().expect("sink lock poisoned") = execution_id.to_string();
    }
}

/// Read requests from stdin until EOF or SIGINT/SIGTERM, then shut the
/// bridge down cooperatively.
pub async fn serve(bridge: Arc<Bridge>) -> Result<()> {
    bridge.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received; shutting down");
                break;
            }
        };
        let Some(line) = line else {
            info!("Transport closed; shutting down");
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<InboundRequest>(line) {
            Ok(request) => bridge.dispatch(request).await,
            Err(e) => warn!(error = %e, "Skipping malformed inbound request"),
        }
    }

    bridge.stop().await;
    Ok(())
}
