//! Script-queue integration: a runner task driving the dequeue/resolve side
//! while tool handlers await the enqueue side.

use page_audit::{
    AgentConfig, CancelToken, Error, NetworkCache, Orchestrator, ScriptQueue, ToolExecutor,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// A cooperative in-process "page runner": polls for work and evaluates a
/// canned response per script.
fn spawn_runner(
    scripts: Arc<ScriptQueue>,
    target: &'static str,
    respond: impl Fn(&str) -> Option<String> + Send + 'static,
) {
    let _ = env_logger::builder().is_test(true).try_init();
    tokio::spawn(async move {
        loop {
            if let Some(script) = scripts.dequeue(target) {
                match respond(&script.code) {
                    Some(result) => scripts.resolve(&script.id, result),
                    None => scripts.reject(&script.id, "SyntaxError: unexpected token"),
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });
}

#[tokio::test]
async fn runner_round_trip_with_console_output() {
    let scripts = Arc::new(ScriptQueue::default());
    spawn_runner(scripts.clone(), "tab-1", |code| {
        (code == "document.title").then(|| {
            "\"Dashboard\"\n\nConsole logs:\n[app] booted".to_string()
        })
    });

    let result = scripts.enqueue("tab-1", "document.title").await.unwrap();
    assert_eq!(result, "\"Dashboard\"\n\nConsole logs:\n[app] booted");
}

#[tokio::test]
async fn runner_rejection_becomes_tool_error() {
    let scripts = Arc::new(ScriptQueue::default());
    spawn_runner(scripts.clone(), "tab-1", |_| None);

    let err = scripts.enqueue("tab-1", "{{{").await.unwrap_err();
    assert!(matches!(err, Error::Tool(_)));
    assert!(err.to_string().contains("SyntaxError"));
}

#[tokio::test]
async fn unresponsive_runner_times_out_and_late_resolve_is_dropped() {
    // Scenario: the runner dequeues the script but never reports back
    // within the deadline.
    let scripts = Arc::new(ScriptQueue::new(Duration::from_millis(50)));

    let q = scripts.clone();
    let producer = tokio::spawn(async move { q.enqueue("tab-1", "while(true){}").await });
    tokio::task::yield_now().await;

    let script = scripts.dequeue("tab-1").expect("script was queued");

    let err = producer.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Timeout));

    // The id is poisoned: a very late resolve has no observable effect.
    scripts.resolve(&script.id, "finally finished");
    assert_eq!(scripts.pending_for_target("tab-1"), 0);
    assert!(scripts.dequeue("tab-1").is_none());
}

#[tokio::test]
async fn executor_surfaces_timeout_as_structured_error() {
    let scripts = Arc::new(ScriptQueue::new(Duration::from_millis(40)));
    let executor = ToolExecutor::new(Arc::new(NetworkCache::new()), scripts);

    let result = executor
        .execute(
            "execute_javascript",
            &json!({"code": "while(true){}"}),
            "tab-1",
            &CancelToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(result, json!({"error": "ExecutionTimeout"}));
}

#[tokio::test]
async fn target_teardown_rejects_in_flight_scripts() {
    let scripts = Arc::new(ScriptQueue::default());

    let q = scripts.clone();
    let producer = tokio::spawn(async move { q.enqueue("tab-1", "1+1").await });
    tokio::task::yield_now().await;

    // The tab closes before any runner shows up.
    scripts.cancel_target("tab-1");

    let err = producer.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::TargetClosed(_)));
}

#[tokio::test]
async fn scripts_for_independent_targets_do_not_interfere() {
    let scripts = Arc::new(ScriptQueue::default());
    spawn_runner(scripts.clone(), "tab-2", |code| Some(format!("ran: {code}")));

    let q = scripts.clone();
    let stuck = tokio::spawn(async move {
        // No runner for tab-1; this one just sits pending.
        q.enqueue("tab-1", "a").await
    });
    tokio::task::yield_now().await;

    let result = scripts.enqueue("tab-2", "b").await.unwrap();
    assert_eq!(result, "ran: b");
    assert_eq!(scripts.pending_for_target("tab-1"), 1);

    scripts.cancel_target("tab-1");
    assert!(stuck.await.unwrap().is_err());
}

/// Scenario: `execute_javascript` timing out inside a live conversation
/// produces an `{"error": "ExecutionTimeout"}` tool result, the model sees
/// it, and the conversation still completes.
#[tokio::test]
async fn script_timeout_inside_conversation_is_recoverable() {
    use async_trait::async_trait;
    use page_audit::{
        BlockKind, EventStream, ModelClient, ModelRequest, ProtocolEvent, Result, StopReason,
        StreamChunk,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct TwoTurnModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelClient for TwoTurnModel {
        async fn stream(&self, _request: ModelRequest) -> Result<EventStream> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let events: Vec<Result<ProtocolEvent>> = if call == 0 {
                vec![
                    Ok(ProtocolEvent::BlockStart {
                        index: 0,
                        kind: BlockKind::ToolUse {
                            id: "tu_1".to_string(),
                            name: "execute_javascript".to_string(),
                        },
                    }),
                    Ok(ProtocolEvent::ToolArgsDelta {
                        index: 0,
                        partial_json: r#"{"code":"while(true){}"}"#.to_string(),
                    }),
                    Ok(ProtocolEvent::BlockStop { index: 0 }),
                    Ok(ProtocolEvent::StopReason(StopReason::ToolUse)),
                    Ok(ProtocolEvent::MessageStop),
                ]
            } else {
                vec![
                    Ok(ProtocolEvent::BlockStart {
                        index: 0,
                        kind: BlockKind::Text,
                    }),
                    Ok(ProtocolEvent::TextDelta {
                        text: "the script hung".to_string(),
                    }),
                    Ok(ProtocolEvent::BlockStop { index: 0 }),
                    Ok(ProtocolEvent::StopReason(StopReason::EndTurn)),
                    Ok(ProtocolEvent::MessageStop),
                ]
            };
            Ok(Box::pin(futures::stream::iter(events)))
        }
    }

    let scripts = Arc::new(ScriptQueue::new(Duration::from_millis(40)));
    let tools = Arc::new(ToolExecutor::new(
        Arc::new(NetworkCache::new()),
        scripts.clone(),
    ));
    let orch = Orchestrator::new(
        Arc::new(TwoTurnModel {
            calls: AtomicUsize::new(0),
        }),
        tools,
        AgentConfig::default(),
    );

    orch.start("c1", "run the miner", "tab-1").unwrap();

    let mut chunks = Vec::new();
    let mut status = page_audit::ConversationStatus::Streaming;
    for _ in 0..100 {
        let updates = orch.poll("c1").unwrap();
        chunks.extend(updates.chunks);
        status = updates.status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(status, page_audit::ConversationStatus::Completed);
    let timeout_result = chunks
        .iter()
        .find_map(|c| match c {
            StreamChunk::ToolResult { result, .. } => Some(result),
            _ => None,
        })
        .expect("tool result chunk present");
    assert_eq!(timeout_result["error"], "ExecutionTimeout");
}
