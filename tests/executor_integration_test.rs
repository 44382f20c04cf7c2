//! End-to-end executor scenarios driven through the public submit path.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{wait_for, RecordingSink};
use tether::adapters::providers::{MockBehavior, MockProvider, ProviderRegistry};
use tether::domain::errors::ProviderError;
use tether::domain::models::{ErrorCode, SandboxConfig, TaskRequest};
use tether::infrastructure::metrics::AtomicCounterSink;
use tether::infrastructure::sandbox::Sandbox;
use tether::services::{TaskExecutor, TaskQueue};

fn build_executor(
    provider: MockProvider,
    sandbox: Option<Arc<Sandbox>>,
) -> (Arc<TaskExecutor>, Arc<RecordingSink>, Arc<AtomicCounterSink>) {
    let registry = Arc::new(ProviderRegistry::new());
    registry.register("claude", Arc::new(provider));
    let sink = Arc::new(RecordingSink::new());
    let counters = Arc::new(AtomicCounterSink::new());
    let executor = Arc::new(TaskExecutor::new(
        Arc::new(TaskQueue::new(10)),
        registry,
        sandbox,
        sink.clone(),
        counters.clone(),
    ));
    (executor, sink, counters)
}

#[tokio::test]
async fn happy_path_emits_start_progress_and_result() {
    let provider = MockProvider::new("claude").with_behavior(MockBehavior {
        output: "ok".to_string(),
        input_tokens: 10,
        output_tokens: 20,
        delay: Duration::from_millis(100),
        ..MockBehavior::default()
    });
    let (executor, sink, counters) = build_executor(provider, None);

    executor.start();
    executor
        .submit(
            TaskRequest::new("e1", "hi")
                .with_model("claude-sonnet-4")
                .with_timeout(60),
        )
        .unwrap();

    assert!(wait_for(|| !sink.results().is_empty(), 5_000).await);
    executor.stop().await;

    let results = sink.results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].execution_id, "e1");
    assert_eq!(results[0].output, "ok");
    assert_eq!(results[0].exit_code, 0);
    let usage = results[0].token_usage.unwrap();
    assert_eq!(usage.input, 10);
    assert_eq!(usage.output, 20);

    // progress 0 first, 100 last, monotone throughout, all tagged e1.
    let progress = sink.progress_events();
    assert_eq!(progress.first().unwrap().progress, 0);
    assert_eq!(progress.last().unwrap().progress, 100);
    assert!(progress.iter().all(|p| p.execution_id == "e1"));
    let values: Vec<u8> = progress.iter().map(|p| p.progress).collect();
    assert!(values.windows(2).all(|w| w[0] <= w[1]), "progress not monotone: {values:?}");

    assert!(sink.errors().is_empty());
    assert_eq!(counters.get("tasks_completed"), 1);
}

#[tokio::test]
async fn timeout_produces_single_retryable_error() {
    let provider = MockProvider::new("claude").with_behavior(MockBehavior {
        delay: Duration::from_secs(10),
        ..MockBehavior::default()
    });
    let (executor, sink, _counters) = build_executor(provider, None);

    executor.start();
    let started = Instant::now();
    executor
        .submit(
            TaskRequest::new("e2", "hi")
                .with_model("claude-sonnet-4")
                .with_timeout(1),
        )
        .unwrap();

    assert!(wait_for(|| !sink.errors().is_empty(), 6_000).await);
    assert!(started.elapsed() < Duration::from_secs(6));
    executor.stop().await;

    let errors = sink.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].execution_id, "e2");
    assert_eq!(errors[0].code, ErrorCode::Timeout);
    assert!(errors[0].retryable);
    assert!(sink.results().is_empty());
}

#[tokio::test]
async fn sandbox_violation_is_fatal_and_not_retryable() {
    let home = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(home.path().join("projects")).unwrap();
    let sandbox = Sandbox::with_home(
        &SandboxConfig {
            enabled: true,
            allowed_paths: vec!["~/projects".to_string()],
            denied_paths: vec![],
            deny_hidden_dirs: true,
        },
        Some(PathBuf::from(home.path())),
    );

    let provider = MockProvider::new("claude").with_behavior(MockBehavior::success("nope"));
    let (executor, sink, _counters) = build_executor(provider, Some(Arc::new(sandbox)));

    executor.start();
    executor
        .submit(
            TaskRequest::new("e3", "hi")
                .with_model("claude-sonnet-4")
                .with_work_dir("/etc/x"),
        )
        .unwrap();

    assert!(wait_for(|| !sink.errors().is_empty(), 5_000).await);
    executor.stop().await;

    let errors = sink.errors();
    assert_eq!(errors[0].code, ErrorCode::SandboxViolation);
    assert!(!errors[0].retryable);
    assert!(sink.results().is_empty());
}

#[tokio::test]
async fn every_task_gets_exactly_one_terminal_event() {
    let provider = MockProvider::new("claude").with_behavior(MockBehavior::success("done"));
    let (executor, sink, _counters) = build_executor(provider, None);

    executor.start();
    for i in 0..5 {
        executor
            .submit(
                TaskRequest::new(format!("t{i}"), "go")
                    .with_model("claude-sonnet-4")
                    .with_timeout(30),
            )
            .unwrap();
    }

    assert!(wait_for(|| sink.results().len() + sink.errors().len() == 5, 10_000).await);
    executor.stop().await;

    assert_eq!(sink.results().len(), 5);
    assert!(sink.errors().is_empty());

    // FIFO: results come back in submission order, and no event of task
    // n+1 precedes the terminal event of task n.
    let results = sink.results();
    let ids: Vec<&str> = results.iter().map(|r| r.execution_id.as_str()).collect();
    assert_eq!(ids, vec!["t0", "t1", "t2", "t3", "t4"]);

    let log = sink.event_log();
    for i in 0..4 {
        let terminal = log
            .iter()
            .position(|(kind, id)| *kind == "result" && id == &format!("t{i}"))
            .unwrap();
        let next_first = log
            .iter()
            .position(|(_, id)| id == &format!("t{}", i + 1))
            .unwrap();
        assert!(
            terminal < next_first,
            "task t{} events started before t{i} finished",
            i + 1
        );
    }
}

#[tokio::test]
async fn cancel_current_produces_cancelled_error() {
    let provider = MockProvider::new("claude").with_behavior(MockBehavior {
        delay: Duration::from_secs(30),
        ..MockBehavior::default()
    });
    let (executor, sink, _counters) = build_executor(provider, None);

    executor.start();
    executor
        .submit(
            TaskRequest::new("e4", "hi")
                .with_model("claude-sonnet-4")
                .with_timeout(60),
        )
        .unwrap();

    assert!(wait_for(|| executor.is_executing(), 2_000).await);
    assert_eq!(executor.current_execution_id().as_deref(), Some("e4"));
    executor.cancel_current();

    assert!(wait_for(|| !sink.errors().is_empty(), 5_000).await);
    executor.stop().await;

    let errors = sink.errors();
    assert_eq!(errors[0].code, ErrorCode::Cancelled);
    assert!(!errors[0].retryable);
}

#[tokio::test]
async fn provider_crash_does_not_kill_the_loop() {
    let provider = MockProvider::new("claude").with_behavior(MockBehavior::failure(
        ProviderError::Internal("provider exploded".to_string()),
    ));
    let (executor, sink, _counters) = build_executor(provider, None);

    executor.start();
    executor
        .submit(TaskRequest::new("e5", "a").with_model("claude-sonnet-4"))
        .unwrap();
    executor
        .submit(TaskRequest::new("e6", "b").with_model("claude-sonnet-4"))
        .unwrap();

    assert!(wait_for(|| sink.errors().len() == 2, 5_000).await);
    executor.stop().await;

    let errors = sink.errors();
    assert_eq!(errors[0].execution_id, "e5");
    assert_eq!(errors[1].execution_id, "e6");
    assert!(errors.iter().all(|e| e.code == ErrorCode::InternalError));
}

#[tokio::test]
async fn streaming_task_emits_coalesced_text_progress() {
    let provider = MockProvider::new("claude")
        .with_streaming()
        .with_behavior(MockBehavior {
            output: "First sentence. Second sentence.".to_string(),
            stream_deltas: vec![
                "First sentence.".to_string(),
                " Second sentence.".to_string(),
            ],
            delay: Duration::ZERO,
            ..MockBehavior::default()
        });
    let (executor, sink, _counters) = build_executor(provider, None);

    executor.start();
    executor
        .submit(
            TaskRequest::new("e7", "hi")
                .with_model("claude-sonnet-4")
                .with_timeout(30),
        )
        .unwrap();

    assert!(wait_for(|| !sink.results().is_empty(), 5_000).await);
    executor.stop().await;

    let progress = sink.progress_events();
    let deltas: String = progress
        .iter()
        .filter_map(|p| p.text_delta.clone())
        .collect();
    assert_eq!(deltas, "First sentence. Second sentence.");

    let accumulated = progress
        .iter()
        .filter_map(|p| p.accumulated_text.clone())
        .next_back()
        .unwrap();
    assert_eq!(accumulated, "First sentence. Second sentence.");
}
