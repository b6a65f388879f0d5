//! Integration tests for scripting operations.
//!
//! These tests drive the full client stack (framing, transport, decoding and
//! the async drain loop) against an in-process fake engine connected over
//! Unix socket pairs.
//!
//! # Running
//!
//! ```bash
//! cargo test --test scripting_integration -- --nocapture
//! ```

use std::io::{BufReader, Write};
use std::os::unix::net::UnixStream;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde_json::{json, Value};

use mssqlscripter_client::config::ClientConfig;
use mssqlscripter_client::jsonrpc::{encode_message, ClientState, FrameDecoder};
use mssqlscripter_client::scripting::{ScriptingMessage, ScriptingParams, ScriptingRequest};
use mssqlscripter_client::sqltools::SqlToolsClient;

const OPERATION_ID: &str = "e18b9538-a7ff-4502-9c33-ac63ed42e5a5";

fn test_config() -> ClientConfig {
    ClientConfig {
        poll_interval: Duration::from_millis(5),
        request_timeout: Some(Duration::from_secs(5)),
        ..ClientConfig::default()
    }
}

fn params(file_path: &str) -> ScriptingParams {
    ScriptingParams::builder(file_path, "Server=localhost;Database=AdventureWorks;Password=secret")
        .include_objects(["dbo.Customers", "Sales.Orders"])
        .build()
        .expect("Params should be valid")
}

/// Start a fake engine. `respond` is called for every request frame and
/// returns the frames to send back. The thread returns every request it saw
/// once its input is closed.
fn start_engine<F>(mut respond: F) -> (SqlToolsClient, JoinHandle<Vec<Value>>)
where
    F: FnMut(&Value) -> Vec<Value> + Send + 'static,
{
    let (requests_out, requests_in) = UnixStream::pair().expect("Failed to create socket pair");
    let (responses_in, mut responses_out) =
        UnixStream::pair().expect("Failed to create socket pair");

    let engine = thread::spawn(move || {
        let mut seen = Vec::new();
        for frame in FrameDecoder::new(BufReader::new(requests_in)) {
            let request = frame.expect("Engine received a malformed frame");
            for reply in respond(&request) {
                responses_out
                    .write_all(&encode_message(&reply).unwrap())
                    .expect("Engine write failed");
            }
            seen.push(request);
        }
        seen
    });

    let client = SqlToolsClient::new(requests_out, responses_in, test_config())
        .expect("Client should start");
    (client, engine)
}

fn notification(method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "method": method, "params": params})
}

/// Direct result, plan, one progress event per object, and completion.
fn operation_events(request_id: &Value, operation_id: Value, objects: &[&str]) -> Vec<Value> {
    let mut events = vec![
        json!({"jsonrpc": "2.0", "id": request_id, "result": {"operationId": operation_id}}),
        notification(
            "scripting/scriptPlanNotification",
            json!({
                "operationId": operation_id,
                "sequenceNumber": "1",
                "scriptingObjects": objects
                    .iter()
                    .map(|name| json!({"type": "Table", "schema": "dbo", "name": name}))
                    .collect::<Vec<_>>(),
                "count": objects.len()
            }),
        ),
    ];

    for (index, name) in objects.iter().enumerate() {
        events.push(notification(
            "scripting/scriptProgressNotification",
            json!({
                "operationId": operation_id,
                "sequenceNumber": (index + 2).to_string(),
                "status": "Completed",
                "completedCount": index + 1,
                "totalCount": objects.len(),
                "scriptingObject": {"type": "Table", "schema": "dbo", "name": name}
            }),
        ));
    }

    events.push(notification(
        "scripting/scriptComplete",
        json!({
            "operationId": operation_id,
            "sequenceNumber": (objects.len() + 2).to_string(),
            "hasError": "false",
            "errorMessage": "",
            "errorDetails": "",
            "canceled": "false",
            "success": "true"
        }),
    ));
    events
}

fn kinds(messages: &[ScriptingMessage]) -> Vec<&'static str> {
    messages
        .iter()
        .map(|message| match message {
            ScriptingMessage::Response(_) => "response",
            ScriptingMessage::Plan(_) => "plan",
            ScriptingMessage::Progress(_) => "progress",
            ScriptingMessage::Complete(_) => "complete",
            ScriptingMessage::Unrecognized(_) => "unrecognized",
        })
        .collect()
}

fn progress_names(messages: &[ScriptingMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|message| match message {
            ScriptingMessage::Progress(progress) => Some(progress.scripting_object.name.clone()),
            _ => None,
        })
        .collect()
}

async fn run(client: &SqlToolsClient, request: &mut ScriptingRequest) -> Vec<ScriptingMessage> {
    let mut messages = Vec::new();
    client
        .drain(request, |message| messages.push(message.clone()))
        .await
        .expect("Drain should finish");
    messages
}

/// Test: one operation delivers plan, progress and completion in order.
#[tokio::test]
async fn test_full_scripting_operation() {
    let (mut client, engine) = start_engine(|request| {
        operation_events(&request["id"], json!(OPERATION_ID), &["Customers", "Orders", "Products"])
    });

    let mut request = client.create_scripting_request(params("/tmp/out.sql")).unwrap();
    request.execute().unwrap();
    assert!(!request.completed());

    let messages = run(&client, &mut request).await;
    assert_eq!(
        kinds(&messages),
        vec!["response", "plan", "progress", "progress", "progress", "complete"]
    );
    assert_eq!(progress_names(&messages), vec!["Customers", "Orders", "Products"]);
    assert!(request.completed());
    assert!(request.get_response().is_none());

    match messages.last() {
        Some(ScriptingMessage::Complete(complete)) => {
            assert!(complete.success);
            assert!(!complete.has_error);
            assert_eq!(complete.operation_id, OPERATION_ID);
            assert_eq!(complete.sequence_number, Some(5));
        }
        other => panic!("Expected Complete, got {:?}", other),
    }

    client.shutdown();
    let seen = engine.join().expect("Engine panicked");
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0]["method"], "scripting/script");
    assert_eq!(seen[0]["params"]["FilePath"], "/tmp/out.sql");
    assert_eq!(
        seen[0]["params"]["IncludeObjectCriteria"][1],
        json!({"Type": null, "Schema": "Sales", "Name": "Orders"})
    );
}

/// Test: consecutive requests get consecutive ids.
#[tokio::test]
async fn test_sequential_requests() {
    let (mut client, engine) =
        start_engine(|request| operation_events(&request["id"], request["id"].clone(), &["T"]));

    for (expected_id, path) in [(1, "/tmp/first.sql"), (2, "/tmp/second.sql")] {
        let mut request = client.create_scripting_request(params(path)).unwrap();
        assert_eq!(request.id(), expected_id);
        request.execute().unwrap();
        let messages = run(&client, &mut request).await;
        assert_eq!(messages.len(), 4);
    }

    client.shutdown();
    let seen = engine.join().expect("Engine panicked");
    let ids: Vec<_> = seen.iter().map(|request| request["id"].clone()).collect();
    assert_eq!(ids, vec![json!(1), json!(2)]);
}

/// Alternate the frames of two operations, starting with the second.
fn interleave(first: Vec<Value>, second: Vec<Value>) -> Vec<Value> {
    let mut interleaved = Vec::new();
    let mut first = first.into_iter();
    let mut second = second.into_iter();
    loop {
        let a = first.next();
        let b = second.next();
        if a.is_none() && b.is_none() {
            break;
        }
        interleaved.extend(b);
        interleaved.extend(a);
    }
    interleaved
}

/// Run two concurrent operations whose frames the engine interleaves.
/// `operation_id` maps a request id to the engine's operation id for it.
async fn run_interleaved(operation_id: fn(u64) -> Value) {
    let (mut client, engine) = start_engine(move |request| {
        // Hold the first request; answer both once the second arrives.
        if request["id"] == 1 {
            return Vec::new();
        }
        interleave(
            operation_events(&json!(1), operation_id(1), &["A1", "A2", "A3"]),
            operation_events(&json!(2), operation_id(2), &["B1", "B2"]),
        )
    });

    let mut first = client.create_scripting_request(params("/tmp/a.sql")).unwrap();
    let mut second = client.create_scripting_request(params("/tmp/b.sql")).unwrap();
    first.execute().unwrap();
    second.execute().unwrap();

    let first_messages = run(&client, &mut first).await;
    let second_messages = run(&client, &mut second).await;

    assert_eq!(progress_names(&first_messages), vec!["A1", "A2", "A3"]);
    assert_eq!(progress_names(&second_messages), vec!["B1", "B2"]);
    for (id, messages) in [(1, &first_messages), (2, &second_messages)] {
        assert_eq!(kinds(messages).first(), Some(&"response"));
        assert_eq!(kinds(messages).last(), Some(&"complete"));
        assert_eq!(kinds(messages).iter().filter(|k| **k == "complete").count(), 1);

        let expected = match operation_id(id) {
            Value::String(text) => text,
            other => other.to_string(),
        };
        for message in messages.iter() {
            assert_eq!(message.operation_id(), Some(expected.as_str()));
        }
    }

    client.shutdown();
    engine.join().expect("Engine panicked");
}

/// Test: events of two concurrent operations are routed by numeric operation id.
#[tokio::test]
async fn test_interleaved_operations_keep_order() {
    run_interleaved(|id| json!(id)).await;
}

/// Test: events of two concurrent operations are routed by the engine's own
/// operation ids, learned from each request's direct result.
#[tokio::test]
async fn test_interleaved_engine_operations_keep_order() {
    run_interleaved(|id| json!(format!("guid-{}", id))).await;
}

/// Test: an engine dying mid-frame ends the operation with exactly one error event.
#[tokio::test]
async fn test_engine_failure_yields_one_error_event() {
    let (requests_out, requests_in) = UnixStream::pair().unwrap();
    let (responses_in, mut responses_out) = UnixStream::pair().unwrap();

    let engine = thread::spawn(move || {
        let mut frames = FrameDecoder::new(BufReader::new(requests_in));
        let request = frames.next().unwrap().unwrap();
        let events = operation_events(&request["id"], json!(OPERATION_ID), &["Customers"]);
        for event in &events[..2] {
            responses_out
                .write_all(&encode_message(event).unwrap())
                .unwrap();
        }
        responses_out
            .write_all(b"Content-Length: 120\r\n\r\n{\"jsonrpc\":\"2.0\"")
            .unwrap();
    });

    let mut client = SqlToolsClient::new(requests_out, responses_in, test_config()).unwrap();
    let mut request = client.create_scripting_request(params("/tmp/out.sql")).unwrap();
    request.execute().unwrap();

    let messages = run(&client, &mut request).await;
    assert_eq!(kinds(&messages), vec!["response", "plan", "complete"]);

    match messages.last() {
        Some(ScriptingMessage::Complete(complete)) => {
            assert!(complete.has_error);
            assert!(!complete.success);
            assert_eq!(
                complete.error_message.as_deref(),
                Some(ScriptingRequest::TRANSPORT_FAILURE_MESSAGE)
            );
        }
        other => panic!("Expected Complete, got {:?}", other),
    }
    assert!(request.completed());
    assert!(request.get_response().is_none());

    engine.join().expect("Engine panicked");
    client.shutdown();
    assert_eq!(client.state(), ClientState::Stopped);
}

/// Test: a JSON-RPC error reply terminates the operation.
#[tokio::test]
async fn test_engine_error_reply() {
    let (mut client, engine) = start_engine(|request| {
        vec![json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": -32603, "message": "Login failed for user 'sa'"}
        })]
    });

    let mut request = client.create_scripting_request(params("/tmp/out.sql")).unwrap();
    request.execute().unwrap();
    let event = client.drain(&mut request, |_| {}).await.unwrap();

    assert!(event.has_error);
    assert_eq!(event.error_message.as_deref(), Some("Login failed for user 'sa'"));
    assert!(request.completed());

    client.shutdown();
    engine.join().expect("Engine panicked");
}

/// Test: shutdown stops the client and can be repeated.
#[test]
fn test_shutdown_is_idempotent() {
    let (mut client, engine) = start_engine(|_| Vec::new());
    assert_eq!(client.state(), ClientState::Running);

    client.shutdown();
    assert_eq!(client.state(), ClientState::Stopped);
    client.shutdown();
    assert_eq!(client.state(), ClientState::Stopped);

    assert!(engine.join().expect("Engine panicked").is_empty());

    let mut request = client.create_scripting_request(params("/tmp/out.sql")).unwrap();
    assert!(request.execute().is_err());
    assert!(request.completed());
}
