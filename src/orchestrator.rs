//! The conversation orchestrator: the agent loop and its registry.
//!
//! One [`Orchestrator`] owns every live conversation. [`Orchestrator::start`]
//! appends the user prompt and spawns the loop onto the runtime; the caller
//! returns immediately and follows progress through [`Orchestrator::poll`].
//!
//! # The loop
//!
//! ```text
//! trim history ─► model stream ─► fold events into chunks + assistant parts
//!       ▲                                       │
//!       │                         tool_use parts and stop_reason ≠ end_turn?
//!       │                                       │
//!       └── append assistant message ◄── dispatch tools in wire order
//!                                               │ no tools / end_turn
//!                                               ▼
//!                                      append assistant, emit Finish
//! ```
//!
//! Turn cap, loop detection, and fatal errors all funnel through one exit
//! path that seals the conversation with a single `Error` chunk.
//! Cancellation is observed between events, before each tool dispatch, and
//! inside script-queue awaits; it seals the conversation as `aborted`
//! without a chunk.

use crate::client::{ModelClient, ModelRequest};
use crate::config::AgentConfig;
use crate::conversation::{Conversation, Updates};
use crate::tools::{ToolExecutor, is_failure_result};
use crate::types::{
    CancelToken, ContentBlock, Message, StreamChunk, ToolResultBlock, ToolUseBlock,
};
use crate::utils::{BlockOutcome, ProtocolEvent, StopReason, TurnAccumulator};
use crate::{Error, Result};
use futures::StreamExt;
use log::{debug, error, info};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Consecutive same-tool failures that terminate a conversation.
const LOOP_DETECTION_THRESHOLD: u32 = 3;

/// Process-wide agent: conversation registry + loop driver.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    conversations: Mutex<HashMap<String, Conversation>>,
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolExecutor>,
    config: AgentConfig,
}

impl Orchestrator {
    pub fn new(model: Arc<dyn ModelClient>, tools: Arc<ToolExecutor>, config: AgentConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                conversations: Mutex::new(HashMap::new()),
                model,
                tools,
                config,
            }),
        }
    }

    // ── Consumer API ──────────────────────────────────────────────────────

    /// Create or continue a conversation: append the user prompt and spawn
    /// the agent loop. Returns as soon as the loop is scheduled.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidInput`] when the conversation is currently streaming
    /// (each record has one loop at a time). Finished conversations (any
    /// terminal state) are reopened for the new prompt.
    pub fn start(&self, conversation_id: &str, prompt: &str, target_id: &str) -> Result<()> {
        {
            let mut conversations = self.inner.lock_registry();
            let conversation = conversations
                .entry(conversation_id.to_string())
                .or_insert_with(|| Conversation::new(conversation_id, target_id));

            if conversation.status().is_terminal() {
                conversation.reopen();
            } else if !conversation.messages().is_empty() || !conversation.full_text().is_empty() {
                // Exists and still streaming: a second loop would race the
                // first over the same record.
                return Err(Error::invalid_input(format!(
                    "conversation {conversation_id} is already streaming"
                )));
            }

            conversation.append_message(Message::user(prompt));
        }
        info!("starting conversation {conversation_id} against target {target_id}");

        let inner = self.inner.clone();
        let id = conversation_id.to_string();
        tokio::spawn(async move {
            Inner::run(inner, id).await;
        });
        Ok(())
    }

    /// Drain buffered chunks and report status. Idempotent when no new
    /// events arrived since the last poll.
    pub fn poll(&self, conversation_id: &str) -> Result<Updates> {
        let mut conversations = self.inner.lock_registry();
        conversations
            .get_mut(conversation_id)
            .map(Conversation::take_updates)
            .ok_or_else(|| {
                Error::invalid_input(format!("unknown conversation: {conversation_id}"))
            })
    }

    /// Signal cancellation. Status becomes `aborted` at the loop's next
    /// observation point. Idempotent; unknown ids are a no-op.
    pub fn abort(&self, conversation_id: &str) {
        let conversations = self.inner.lock_registry();
        if let Some(conversation) = conversations.get(conversation_id) {
            debug!("aborting conversation {conversation_id}");
            conversation.cancel_token().cancel();
        }
    }

    /// Remove the record entirely, cancelling any loop still running.
    /// Idempotent.
    pub fn cleanup(&self, conversation_id: &str) {
        let mut conversations = self.inner.lock_registry();
        if let Some(conversation) = conversations.remove(conversation_id) {
            conversation.cancel_token().cancel();
        }
    }

    /// Current token usage for a conversation, `(input, output)`.
    pub fn token_usage(&self, conversation_id: &str) -> Option<(u64, u64)> {
        let conversations = self.inner.lock_registry();
        conversations
            .get(conversation_id)
            .map(|c| (c.tokens_in(), c.tokens_out()))
    }

    /// Snapshot of a conversation's message history.
    pub fn history(&self, conversation_id: &str) -> Option<Vec<Message>> {
        let conversations = self.inner.lock_registry();
        conversations
            .get(conversation_id)
            .map(|c| c.messages().to_vec())
    }
}

impl Inner {
    fn lock_registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, Conversation>> {
        self.conversations.lock().expect("conversation registry poisoned")
    }

    /// Short-held access to one conversation. `None` when the record was
    /// cleaned up under the running loop.
    fn with<R>(&self, id: &str, f: impl FnOnce(&mut Conversation) -> R) -> Option<R> {
        let mut conversations = self.lock_registry();
        conversations.get_mut(id).map(f)
    }

    /// Top-level loop driver: runs the turns, then seals the record.
    async fn run(inner: Arc<Inner>, id: String) {
        match inner.drive(&id).await {
            Ok(()) => {
                debug!("conversation {id} completed");
            }
            Err(Error::Cancelled) => {
                info!("conversation {id} aborted");
                inner.with(&id, |c| c.mark_aborted());
            }
            Err(e) => {
                error!("conversation {id} failed: {e}");
                inner.with(&id, |c| c.fail(e.to_string()));
            }
        }
    }

    /// The agent loop. Returns `Ok` only after sealing the conversation as
    /// completed; every failure path returns `Err` for [`Inner::run`] to
    /// seal.
    async fn drive(&self, id: &str) -> Result<()> {
        for turn in 1..=self.config.max_turns() {
            let (messages, target_id, cancel) = self
                .with(id, |c| {
                    c.trim_history(self.config.max_history());
                    (c.messages().to_vec(), c.target_id().to_string(), c.cancel_token())
                })
                .ok_or(Error::Cancelled)?;

            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            debug!("conversation {id}: turn {turn}, {} messages", messages.len());

            let request = ModelRequest {
                messages,
                system: self.config.system_prompt().to_string(),
                tools: ToolExecutor::definitions(),
                max_tokens: self.config.max_tokens(),
                temperature: self.config.temperature(),
            };

            let turn_outcome = self.run_turn(id, request, &cancel).await?;

            let TurnOutcome { parts, stop_reason } = turn_outcome;
            let tool_uses: Vec<ToolUseBlock> = parts
                .iter()
                .filter_map(|part| match part {
                    ContentBlock::ToolUse(t) => Some(t.clone()),
                    _ => None,
                })
                .collect();

            // End of the conversation: nothing to execute, or the model
            // explicitly closed its turn.
            if tool_uses.is_empty() || stop_reason == Some(StopReason::EndTurn) {
                // An end_turn that still carries tool_use parts would dangle
                // them in history; keep only the text.
                let text_parts: Vec<ContentBlock> = parts
                    .into_iter()
                    .filter(|p| matches!(p, ContentBlock::Text(_)))
                    .collect();
                self.with(id, |c| {
                    if !text_parts.is_empty() {
                        c.append_message(Message::assistant(text_parts));
                    }
                    c.complete();
                })
                .ok_or(Error::Cancelled)?;
                return Ok(());
            }

            // Dispatch every tool in wire order, folding results into the
            // same assistant message.
            let mut assistant_parts = parts;
            for tool_use in &tool_uses {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let result_part = self
                    .dispatch_tool(id, tool_use, &target_id, &cancel)
                    .await?;
                assistant_parts.push(result_part);
            }

            self.with(id, |c| c.append_message(Message::assistant(assistant_parts)))
                .ok_or(Error::Cancelled)?;
        }

        Err(Error::TurnLimit(self.config.max_turns()))
    }

    /// Consume one model stream: emit chunks as events arrive and assemble
    /// the assistant's content parts.
    async fn run_turn(
        &self,
        id: &str,
        request: ModelRequest,
        cancel: &CancelToken,
    ) -> Result<TurnOutcome> {
        let mut stream = self.model.stream(request).await?;
        let mut accumulator = TurnAccumulator::new();
        let mut stop_reason = None;

        loop {
            // Race the next event against cancellation so an abort lands
            // even while the model is silent. Dropping the stream aborts
            // the transport request with it.
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = stream.next() => next,
            };
            let Some(event) = next else { break };
            let event = event?;

            match &event {
                ProtocolEvent::TextDelta { text } if !text.is_empty() => {
                    self.with(id, |c| {
                        c.append_chunk(StreamChunk::TextDelta { text: text.clone() })
                    })
                    .ok_or(Error::Cancelled)?;
                }
                ProtocolEvent::UsageStart { input_tokens } => {
                    self.with(id, |c| c.add_tokens(*input_tokens, 0))
                        .ok_or(Error::Cancelled)?;
                }
                ProtocolEvent::Usage { output_tokens } => {
                    self.with(id, |c| c.add_tokens(0, *output_tokens))
                        .ok_or(Error::Cancelled)?;
                }
                ProtocolEvent::StopReason(reason) => {
                    stop_reason = Some(reason.clone());
                }
                ProtocolEvent::MessageStop => break,
                _ => {}
            }

            match accumulator.process(&event) {
                BlockOutcome::ToolComplete(block) => {
                    self.with(id, |c| {
                        c.append_chunk(StreamChunk::ToolCall {
                            id: block.id.clone(),
                            name: block.name.clone(),
                            args: block.input.clone(),
                        })
                    })
                    .ok_or(Error::Cancelled)?;
                }
                BlockOutcome::ToolParseError { index, error } => {
                    // Advisory, not fatal: the turn goes on with whatever
                    // other blocks are usable.
                    self.with(id, |c| {
                        c.append_chunk(StreamChunk::Error {
                            message: format!(
                                "tool arguments at block {index} were unparsable: {error}"
                            ),
                        })
                    })
                    .ok_or(Error::Cancelled)?;
                }
                BlockOutcome::None => {}
            }
        }

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        Ok(TurnOutcome {
            parts: accumulator.finish(),
            stop_reason,
        })
    }

    /// Execute one tool call: emit its result chunk, update the loop
    /// detector, and produce the `tool_result` part for the history.
    async fn dispatch_tool(
        &self,
        id: &str,
        tool_use: &ToolUseBlock,
        target_id: &str,
        cancel: &CancelToken,
    ) -> Result<ContentBlock> {
        let outcome = self
            .tools
            .execute(&tool_use.name, &tool_use.input, target_id, cancel)
            .await;

        let (result, is_error) = match outcome {
            Ok(value) => (value, false),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            // Unknown tool (and any other raised failure): fed back to the
            // model as an error result rather than killing the loop.
            Err(e) => (json!({ "error": e.to_string() }), true),
        };

        let failed = is_error || is_failure_result(&result);
        let streak = self
            .with(id, |c| {
                let state = c.loop_state_mut();
                if failed {
                    state.record_failure(&tool_use.name)
                } else {
                    state.record_success();
                    0
                }
            })
            .ok_or(Error::Cancelled)?;

        self.with(id, |c| {
            c.append_chunk(StreamChunk::ToolResult {
                id: tool_use.id.clone(),
                name: tool_use.name.clone(),
                result: result.clone(),
            })
        })
        .ok_or(Error::Cancelled)?;

        if streak >= LOOP_DETECTION_THRESHOLD {
            return Err(Error::LoopDetected(format!(
                "model is repeatedly misusing tool {}",
                tool_use.name
            )));
        }

        // String results go into history verbatim; structured results as
        // compact JSON.
        let content = match &result {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other)?,
        };
        Ok(ContentBlock::ToolResult(ToolResultBlock {
            tool_use_id: tool_use.id.clone(),
            content,
            is_error,
        }))
    }
}

struct TurnOutcome {
    parts: Vec<ContentBlock>,
    stop_reason: Option<StopReason>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NetworkCache;
    use crate::client::EventStream;
    use crate::script::ScriptQueue;
    use crate::utils::BlockKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted model: each call to `stream` replays the next canned event
    /// sequence.
    struct ScriptedModel {
        turns: Vec<Vec<ProtocolEvent>>,
        call: AtomicUsize,
    }

    impl ScriptedModel {
        fn new(turns: Vec<Vec<ProtocolEvent>>) -> Arc<Self> {
            Arc::new(Self {
                turns,
                call: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn stream(&self, _request: ModelRequest) -> Result<EventStream> {
            let turn = self.call.fetch_add(1, Ordering::SeqCst);
            let events = self.turns.get(turn).cloned().unwrap_or_default();
            Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
        }
    }

    fn text_turn(text_parts: &[&str]) -> Vec<ProtocolEvent> {
        let mut events = vec![
            ProtocolEvent::UsageStart { input_tokens: 10 },
            ProtocolEvent::BlockStart {
                index: 0,
                kind: BlockKind::Text,
            },
        ];
        for part in text_parts {
            events.push(ProtocolEvent::TextDelta {
                text: part.to_string(),
            });
        }
        events.push(ProtocolEvent::BlockStop { index: 0 });
        events.push(ProtocolEvent::Usage { output_tokens: 5 });
        events.push(ProtocolEvent::StopReason(StopReason::EndTurn));
        events.push(ProtocolEvent::MessageStop);
        events
    }

    fn orchestrator(model: Arc<dyn ModelClient>) -> Orchestrator {
        let tools = Arc::new(ToolExecutor::new(
            Arc::new(NetworkCache::new()),
            Arc::new(ScriptQueue::default()),
        ));
        Orchestrator::new(model, tools, AgentConfig::default())
    }

    async fn wait_terminal(orch: &Orchestrator, id: &str) -> Updates {
        let mut all_chunks = Vec::new();
        for _ in 0..200 {
            let updates = orch.poll(id).unwrap();
            all_chunks.extend(updates.chunks);
            if updates.status.is_terminal() {
                return Updates {
                    chunks: all_chunks,
                    status: updates.status,
                    full_text: updates.full_text,
                };
            }
            tokio::task::yield_now().await;
        }
        panic!("conversation {id} never reached a terminal state");
    }

    #[tokio::test]
    async fn test_start_rejects_concurrent_start() {
        // A model that never yields keeps the conversation streaming.
        struct HangingModel;
        #[async_trait]
        impl ModelClient for HangingModel {
            async fn stream(&self, _request: ModelRequest) -> Result<EventStream> {
                Ok(Box::pin(futures::stream::pending()))
            }
        }

        let orch = orchestrator(Arc::new(HangingModel));
        orch.start("c1", "hello", "tab-1").unwrap();
        tokio::task::yield_now().await;

        let err = orch.start("c1", "again", "tab-1").unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        orch.abort("c1");
    }

    #[tokio::test]
    async fn test_poll_unknown_conversation_errors() {
        let orch = orchestrator(ScriptedModel::new(vec![]));
        assert!(orch.poll("missing").is_err());
    }

    #[tokio::test]
    async fn test_single_turn_token_accounting() {
        let model = ScriptedModel::new(vec![text_turn(&["done"])]);
        let orch = orchestrator(model);
        orch.start("c1", "hi", "tab-1").unwrap();
        wait_terminal(&orch, "c1").await;
        assert_eq!(orch.token_usage("c1"), Some((10, 5)));
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let model = ScriptedModel::new(vec![text_turn(&["done"])]);
        let orch = orchestrator(model);
        orch.start("c1", "hi", "tab-1").unwrap();
        wait_terminal(&orch, "c1").await;

        orch.cleanup("c1");
        orch.cleanup("c1");
        assert!(orch.poll("c1").is_err());
    }

    #[tokio::test]
    async fn test_turn_cap_produces_error() {
        // Every turn requests the same tool and never ends the turn; the
        // tool succeeds, so loop detection stays quiet and the cap fires.
        let tool_turn = || {
            vec![
                ProtocolEvent::BlockStart {
                    index: 0,
                    kind: BlockKind::ToolUse {
                        id: "tu_1".to_string(),
                        name: "get_cache_statistics".to_string(),
                    },
                },
                ProtocolEvent::BlockStop { index: 0 },
                ProtocolEvent::StopReason(StopReason::ToolUse),
                ProtocolEvent::MessageStop,
            ]
        };
        let model = ScriptedModel::new((0..5).map(|_| tool_turn()).collect());

        let tools = Arc::new(ToolExecutor::new(
            Arc::new(NetworkCache::new()),
            Arc::new(ScriptQueue::default()),
        ));
        let config = AgentConfig::builder().max_turns(3).build().unwrap();
        let orch = Orchestrator::new(model, tools, config);

        orch.start("c1", "go", "tab-1").unwrap();
        let updates = wait_terminal(&orch, "c1").await;
        assert_eq!(updates.status, crate::ConversationStatus::Error);
        let last = updates.chunks.last().unwrap();
        assert!(
            matches!(last, StreamChunk::Error { message } if message.contains("Turn limit")),
            "unexpected terminal chunk: {last:?}"
        );
    }
}
