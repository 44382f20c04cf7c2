//! Tether — local agent bridge.
//!
//! A long-running host-side process that executes AI-assisted coding tasks
//! on behalf of a remote orchestrator:
//! - Bounded FIFO task queue with a single-task executor
//! - Provider abstraction (API client, one-shot CLI, long-lived JSON-RPC
//!   subprocess) with a hybrid fallback composite and a registry
//! - Stream accumulator coalescing token deltas into readable chunks
//! - Filesystem sandbox for task work directories
//! - QA pipeline runner (build, service, test, browser checks)

pub mod adapters;
pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export key types for convenience
pub use application::{Bridge, InboundRequest};
pub use domain::errors::ProviderError;
pub use domain::models::{Config, QaRequest, QaResult, TaskError, TaskProgress, TaskRequest, TaskResult};
pub use domain::ports::{CounterSink, EventSink, Provider};
