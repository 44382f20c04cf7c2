//! Session protocol tests: a scripted server drives `run_turn` over an
//! in-memory duplex pipe, no subprocess involved.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;

use tether::adapters::providers::rpc::{run_turn, ApprovalPolicy};
use tether::domain::models::ExecuteRequest;
use tether::domain::ports::StreamCallback;
use tether::infrastructure::rpc::JsonRpcClient;

type ServerReader = tokio::io::Lines<BufReader<ReadHalf<tokio::io::DuplexStream>>>;
type ServerWriter = WriteHalf<tokio::io::DuplexStream>;

fn pipe() -> (Arc<JsonRpcClient>, ServerReader, ServerWriter) {
    let (client_side, server_side) = duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_side);
    let (server_read, server_write) = tokio::io::split(server_side);
    (
        Arc::new(JsonRpcClient::new(client_read, client_write)),
        BufReader::new(server_read).lines(),
        server_write,
    )
}

async fn read_request(lines: &mut ServerReader) -> Value {
    let line = tokio::time::timeout(Duration::from_secs(2), lines.next_line())
        .await
        .expect("server read timed out")
        .unwrap()
        .expect("client closed unexpectedly");
    serde_json::from_str(&line).unwrap()
}

async fn write_json(writer: &mut ServerWriter, value: &Value) {
    let line = format!("{value}\n");
    writer.write_all(line.as_bytes()).await.unwrap();
}

/// Answer thread/start and turn/start, returning the turn/start request.
async fn accept_thread_and_turn(lines: &mut ServerReader, writer: &mut ServerWriter) -> Value {
    let thread_start = read_request(lines).await;
    assert_eq!(thread_start["method"], "thread/start");
    write_json(
        writer,
        &json!({"jsonrpc": "2.0", "id": thread_start["id"], "result": {"threadId": "t1"}}),
    )
    .await;

    let turn_start = read_request(lines).await;
    assert_eq!(turn_start["method"], "turn/start");
    write_json(
        writer,
        &json!({"jsonrpc": "2.0", "id": turn_start["id"], "result": {"turnId": "u1"}}),
    )
    .await;
    turn_start
}

fn notification(method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "method": method, "params": params})
}

#[tokio::test]
async fn streamed_turn_assembles_output_from_both_delta_dialects() {
    let (client, mut lines, mut writer) = pipe();

    let deltas: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let callback: StreamCallback = {
        let deltas = deltas.clone();
        Arc::new(move |delta, _accumulated| {
            deltas.lock().unwrap().push(delta.to_string());
        })
    };

    let server = tokio::spawn(async move {
        let turn_start = accept_thread_and_turn(&mut lines, &mut writer).await;
        assert_eq!(turn_start["params"]["threadId"], "t1");
        assert_eq!(turn_start["params"]["input"][0]["type"], "text");

        // One dialect carries `delta`, the other `text`.
        write_json(
            &mut writer,
            &notification(
                "item/agentMessage/delta",
                json!({"threadId": "t1", "delta": "First sentence."}),
            ),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        write_json(
            &mut writer,
            &notification(
                "item/agentMessage/delta",
                json!({"threadId": "t1", "text": " Second sentence."}),
            ),
        )
        .await;
        write_json(
            &mut writer,
            &notification("turn/completed", json!({"threadId": "t1", "turnId": "u1"})),
        )
        .await;
    });

    let request = ExecuteRequest::new("hello").with_model("gpt-5-codex");
    let response = run_turn(
        &client,
        ApprovalPolicy::AutoApprove,
        &request,
        &CancellationToken::new(),
        Some(callback),
    )
    .await
    .unwrap();

    server.await.unwrap();
    assert_eq!(response.output, "First sentence. Second sentence.");
    assert!(!deltas.lock().unwrap().is_empty());
}

#[tokio::test]
async fn completed_items_become_tool_calls() {
    let (client, mut lines, mut writer) = pipe();

    let server = tokio::spawn(async move {
        accept_thread_and_turn(&mut lines, &mut writer).await;

        write_json(
            &mut writer,
            &notification(
                "item/completed",
                json!({
                    "threadId": "t1",
                    "itemId": "i1",
                    "itemType": "commandExecution",
                    "data": {"command": "ls -la", "exitCode": 0, "output": "total 0"}
                }),
            ),
        )
        .await;
        write_json(
            &mut writer,
            &notification(
                "item/completed",
                json!({
                    "threadId": "t1",
                    "itemId": "i2",
                    "itemType": "mcpToolCall",
                    "data": {"toolName": "search", "input": {"q": "rust"}}
                }),
            ),
        )
        .await;
        // Unknown item types are tolerated.
        write_json(
            &mut writer,
            &notification(
                "item/completed",
                json!({"threadId": "t1", "itemId": "i3", "itemType": "reasoning", "data": {}}),
            ),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        write_json(
            &mut writer,
            &notification("turn/completed", json!({"threadId": "t1"})),
        )
        .await;
    });

    let request = ExecuteRequest::new("run ls");
    let response = run_turn(
        &client,
        ApprovalPolicy::AutoApprove,
        &request,
        &CancellationToken::new(),
        None,
    )
    .await
    .unwrap();

    server.await.unwrap();
    assert_eq!(response.tool_calls.len(), 2);
    assert_eq!(response.tool_calls[0].name, "ls -la");
    assert_eq!(response.tool_calls[0].exit_code, Some(0));
    assert_eq!(response.tool_calls[1].name, "search");
}

#[tokio::test]
async fn command_output_deltas_backfill_completed_items() {
    let (client, mut lines, mut writer) = pipe();

    let server = tokio::spawn(async move {
        accept_thread_and_turn(&mut lines, &mut writer).await;

        write_json(
            &mut writer,
            &notification(
                "item/commandExecution/outputDelta",
                json!({"threadId": "t1", "itemId": "i5", "delta": "line one\n"}),
            ),
        )
        .await;
        write_json(
            &mut writer,
            &notification(
                "item/commandExecution/outputDelta",
                json!({"threadId": "t1", "itemId": "i5", "delta": "line two\n"}),
            ),
        )
        .await;
        // Completed item without inline output: the buffered deltas win.
        write_json(
            &mut writer,
            &notification(
                "item/completed",
                json!({
                    "threadId": "t1",
                    "itemId": "i5",
                    "itemType": "commandExecution",
                    "data": {"command": "make build", "exitCode": 0}
                }),
            ),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        write_json(
            &mut writer,
            &notification("turn/completed", json!({"threadId": "t1"})),
        )
        .await;
    });

    let request = ExecuteRequest::new("build it");
    let response = run_turn(
        &client,
        ApprovalPolicy::AutoApprove,
        &request,
        &CancellationToken::new(),
        None,
    )
    .await
    .unwrap();

    server.await.unwrap();
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(
        response.tool_calls[0].output.as_deref(),
        Some("line one\nline two\n")
    );
}

async fn approval_roundtrip(policy: ApprovalPolicy, expected_decision: &str) {
    let (client, mut lines, mut writer) = pipe();

    let expected = expected_decision.to_string();
    let server = tokio::spawn(async move {
        accept_thread_and_turn(&mut lines, &mut writer).await;

        write_json(
            &mut writer,
            &notification(
                "item/commandExecution/requestApproval",
                json!({"threadId": "t1", "itemId": "i9", "command": "rm -r build"}),
            ),
        )
        .await;

        // The client must answer with the matching approvalResponse
        // notification carrying the policy's decision.
        let reply = read_request(&mut lines).await;
        assert_eq!(reply["method"], "item/commandExecution/approvalResponse");
        assert!(reply.get("id").is_none());
        assert_eq!(reply["params"]["threadId"], "t1");
        assert_eq!(reply["params"]["itemId"], "i9");
        assert_eq!(reply["params"]["decision"], expected.as_str());

        write_json(
            &mut writer,
            &notification("turn/completed", json!({"threadId": "t1"})),
        )
        .await;
    });

    let request = ExecuteRequest::new("do something");
    run_turn(&client, policy, &request, &CancellationToken::new(), None)
        .await
        .unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn auto_approve_policy_accepts() {
    approval_roundtrip(ApprovalPolicy::AutoApprove, "accept").await;
}

#[tokio::test]
async fn deny_all_policy_declines() {
    approval_roundtrip(ApprovalPolicy::DenyAll, "decline").await;
}

#[tokio::test]
async fn cancellation_interrupts_a_turn() {
    let (client, mut lines, mut writer) = pipe();

    let server = tokio::spawn(async move {
        accept_thread_and_turn(&mut lines, &mut writer).await;
        // Never send turn/completed.
        tokio::time::sleep(Duration::from_secs(5)).await;
    });

    let cancel = CancellationToken::new();
    let canceller = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        })
    };

    let request = ExecuteRequest::new("hang");
    let err = run_turn(&client, ApprovalPolicy::AutoApprove, &request, &cancel, None)
        .await
        .unwrap_err();
    assert!(matches!(err, tether::ProviderError::Cancelled));

    canceller.await.unwrap();
    server.abort();
}

#[tokio::test]
async fn server_error_on_thread_start_maps_to_provider_error() {
    let (client, mut lines, mut writer) = pipe();

    let server = tokio::spawn(async move {
        let thread_start = read_request(&mut lines).await;
        write_json(
            &mut writer,
            &json!({
                "jsonrpc": "2.0",
                "id": thread_start["id"],
                "error": {"code": -32003, "message": "not logged in"}
            }),
        )
        .await;
    });

    let request = ExecuteRequest::new("hi");
    let err = run_turn(
        &client,
        ApprovalPolicy::AutoApprove,
        &request,
        &CancellationToken::new(),
        None,
    )
    .await
    .unwrap_err();

    server.await.unwrap();
    assert!(matches!(err, tether::ProviderError::NoApiKey(_)));
}
