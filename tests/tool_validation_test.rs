//! Defensive-input behavior of the tool registry: bad and boundary inputs
//! must come back as structured `{"error": ...}` results the model can
//! recover from, never as raised errors or silent misbehavior.

use page_audit::{
    CancelToken, EntryMetadata, NetworkCache, NetworkEntry, RequestRecord, ResponseRecord,
    ScriptQueue, Timing, ToolExecutor, is_failure_result,
};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

fn entry(id: &str, url: &str, method: &str, status: u16, response_body: Option<&str>) -> NetworkEntry {
    NetworkEntry {
        id: id.to_string(),
        request: RequestRecord {
            url: url.to_string(),
            method: method.to_string(),
            headers: HashMap::new(),
            body: None,
            timestamp: 1_700_000_000_000,
        },
        response: ResponseRecord {
            status,
            status_text: "OK".to_string(),
            headers: HashMap::new(),
            body: response_body.map(str::to_string),
            content_type: response_body.map(|_| "application/json".to_string()),
        },
        timing: Timing {
            start_time: 0,
            end_time: 18,
            duration_ms: 18,
        },
        metadata: EntryMetadata {
            request_type: "fetch".to_string(),
            has_error: status >= 400,
            error_message: None,
            cookies: None,
            auth_headers: None,
        },
    }
}

fn executor(entries: Vec<NetworkEntry>) -> ToolExecutor {
    let cache = Arc::new(NetworkCache::new());
    for e in entries {
        cache.insert("tab-1", e);
    }
    ToolExecutor::new(cache, Arc::new(ScriptQueue::default()))
}

async fn run(executor: &ToolExecutor, name: &str, input: Value) -> Value {
    executor
        .execute(name, &input, "tab-1", &CancelToken::new())
        .await
        .expect("registered tools return structured errors, not Err")
}

#[tokio::test]
async fn wrong_typed_optional_fields_are_structured_errors() {
    let exec = executor(vec![]);

    for (tool, field, input) in [
        ("get_network_requests", "limit", json!({"limit": -3})),
        ("get_network_requests", "offset", json!({"offset": "x"})),
        (
            "get_request_body_chunk",
            "length",
            json!({"requestId": "r", "bodyType": "response", "length": 1.5}),
        ),
        (
            "search_request_content",
            "limit",
            json!({"query": "q", "limit": false}),
        ),
    ] {
        let result = run(&exec, tool, input).await;
        let message = result["error"].as_str().unwrap_or_else(|| {
            panic!("{tool} should reject bad {field}, got {result}");
        });
        assert!(message.contains(field), "{tool}: {message}");
        assert!(is_failure_result(&result));
    }
}

#[tokio::test]
async fn caps_are_enforced_not_errored() {
    let entries = (0..25)
        .map(|i| entry(&format!("r{i}"), "https://x.test/", "GET", 200, None))
        .collect();
    let exec = executor(entries);

    // Over-cap values clamp instead of failing: the model asked for too
    // much, not for something invalid.
    let listing = run(&exec, "get_network_requests", json!({"limit": 999})).await;
    assert_eq!(listing["returned"], 20);

    let content = run(
        &exec,
        "search_request_content",
        json!({"query": "x.test", "limit": 999}),
    )
    .await;
    assert_eq!(content["found"], 15);
}

#[tokio::test]
async fn offset_past_end_is_empty_not_error() {
    let exec = executor(vec![entry("r0", "https://x.test/", "GET", 200, None)]);

    let listing = run(&exec, "get_network_requests", json!({"offset": 50})).await;
    assert_eq!(listing["returned"], 0);
    assert_eq!(listing["total"], 1);
    assert_eq!(listing["hasMore"], false);

    let chunk = run(
        &exec,
        "get_request_body_chunk",
        json!({"requestId": "r0", "bodyType": "response", "offset": 9999}),
    )
    .await;
    assert_eq!(chunk["chunkSize"], 0);
    assert_eq!(chunk["hasMore"], false);
    assert_eq!(chunk["nextOffset"], Value::Null);
}

#[tokio::test]
async fn multibyte_bodies_truncate_on_character_boundaries() {
    let body = "héllо жмых ".repeat(400); // plenty of multibyte characters
    let mut e = entry("r0", "https://x.test/", "POST", 200, None);
    e.response.body = Some(body.clone());
    let exec = executor(vec![e]);

    let details = run(
        &exec,
        "get_request_details",
        json!({"requestId": "r0", "bodyPreviewSize": 333}),
    )
    .await;
    let preview = details["response"]["body"].as_str().unwrap();
    assert_eq!(preview.chars().count(), 333);
    assert!(body.starts_with(preview));

    let chunk = run(
        &exec,
        "get_request_body_chunk",
        json!({"requestId": "r0", "bodyType": "response", "offset": 7, "length": 11}),
    )
    .await;
    let expected: String = body.chars().skip(7).take(11).collect();
    assert_eq!(chunk["chunk"], expected);
    assert_eq!(chunk["chunkSize"], 11);
}

#[tokio::test]
async fn search_filters_echo_back_exactly_what_was_applied() {
    let exec = executor(vec![
        entry("r0", "https://api.x.test/v1/users", "GET", 200, None),
        entry("r1", "https://api.x.test/v1/users", "POST", 422, None),
    ]);

    let result = run(
        &exec,
        "search_requests",
        json!({"method": "POST", "minStatus": 400, "maxStatus": 499}),
    )
    .await;
    assert_eq!(result["found"], 1);
    assert_eq!(result["filters"]["method"], "POST");
    assert_eq!(result["filters"]["minStatus"], 400);
    assert_eq!(result["filters"]["maxStatus"], 499);
    assert_eq!(result["filters"]["url"], Value::Null);
}

#[tokio::test]
async fn expose_request_data_rejects_non_string_ids_gracefully() {
    let exec = executor(vec![entry(
        "r0",
        "https://api.x.test/v1/users",
        "GET",
        200,
        Some(r#"{"users":[]}"#),
    )]);

    // Non-string array members are skipped; with no usable ids left the
    // tool reports a structured error.
    let result = run(
        &exec,
        "expose_request_data",
        json!({"requestIds": [42, null, {}]}),
    )
    .await;
    assert!(result["error"].is_string());

    let not_an_array = run(
        &exec,
        "expose_request_data",
        json!({"requestIds": "r0"}),
    )
    .await;
    assert!(not_an_array["error"].as_str().unwrap().contains("array"));
}

#[tokio::test]
async fn unknown_tool_error_counts_as_failure_for_loop_detection() {
    let exec = executor(vec![]);
    let err = exec
        .execute("grep_page", &json!({}), "tab-1", &CancelToken::new())
        .await
        .unwrap_err();

    // The orchestrator folds raised tool errors into an {"error": ...}
    // payload; that payload must classify as a failure.
    let payload = json!({"error": err.to_string()});
    assert!(is_failure_result(&payload));
}
