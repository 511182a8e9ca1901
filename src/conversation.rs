//! Per-conversation state: history, outbound buffer, counters, lifecycle.
//!
//! A [`Conversation`] is a pure data container. The orchestrator owns every
//! record through its registry and is the only writer; the consumer
//! observes through [`crate::Orchestrator::poll`], which drains the chunk
//! buffer in one step under the registry lock.
//!
//! # Lifecycle
//!
//! ```text
//! Streaming ──► Completed   (Finish chunk emitted at transition)
//!          ──► Error       (Error chunk emitted, trailing user removed)
//!          ──► Aborted     (no chunk)
//! ```
//!
//! Within a session the status only moves forward: a terminal state never
//! silently resumes streaming, and no chunk is accepted after the terminal
//! one. The single exception is [`Conversation::reopen`], the explicit
//! consumer-driven path for submitting a follow-up prompt to a finished
//! conversation.
//!
//! # History invariant
//!
//! `messages` is a valid alternation for the model: a `user` entry is
//! followed by an `assistant` entry, and an assistant entry that contains
//! `tool_use` parts carries the matching `tool_result` parts within itself.
//! Trimming therefore only cuts at `user`-message boundaries, dropping a
//! whole user/assistant span at a time, so the retained suffix never opens
//! with orphaned results or dangles an unresolved `tool_use`.

use crate::types::{CancelToken, Message, MessageRole, StreamChunk};
use log::warn;
use serde::{Deserialize, Serialize};

/// Where a conversation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Streaming,
    Completed,
    Error,
    Aborted,
}

impl ConversationStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ConversationStatus::Streaming)
    }
}

/// Consecutive same-tool failure tracking for loop detection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopState {
    last_failing_tool: Option<String>,
    consecutive_failures: u32,
}

impl LoopState {
    /// Record a failed execution of `tool`; returns the consecutive count.
    pub fn record_failure(&mut self, tool: &str) -> u32 {
        if self.last_failing_tool.as_deref() == Some(tool) {
            self.consecutive_failures += 1;
        } else {
            self.last_failing_tool = Some(tool.to_string());
            self.consecutive_failures = 1;
        }
        self.consecutive_failures
    }

    /// Record a successful execution; resets the streak.
    pub fn record_success(&mut self) {
        self.last_failing_tool = None;
        self.consecutive_failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// What a consumer poll returns.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Updates {
    pub chunks: Vec<StreamChunk>,
    pub status: ConversationStatus,
    pub full_text: String,
}

/// One conversation record, exclusively owned by the orchestrator registry.
#[derive(Debug)]
pub struct Conversation {
    id: String,
    status: ConversationStatus,
    messages: Vec<Message>,
    chunks: Vec<StreamChunk>,
    full_text: String,
    cancel: CancelToken,
    target_id: String,
    tokens_in: u64,
    tokens_out: u64,
    loop_state: LoopState,
}

impl Conversation {
    pub fn new(id: impl Into<String>, target_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: ConversationStatus::Streaming,
            messages: Vec::new(),
            chunks: Vec::new(),
            full_text: String::new(),
            cancel: CancelToken::new(),
            target_id: target_id.into(),
            tokens_in: 0,
            tokens_out: 0,
            loop_state: LoopState::default(),
        }
    }

    // ── Accessors ─────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> ConversationStatus {
        self.status
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn full_text(&self) -> &str {
        &self.full_text
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn tokens_in(&self) -> u64 {
        self.tokens_in
    }

    pub fn tokens_out(&self) -> u64 {
        self.tokens_out
    }

    pub fn loop_state_mut(&mut self) -> &mut LoopState {
        &mut self.loop_state
    }

    // ── Mutation ──────────────────────────────────────────────────────────

    pub fn append_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Buffer an outbound chunk. Rejected once the conversation is
    /// terminal; the terminal chunk itself goes through
    /// [`Conversation::complete`] / [`Conversation::fail`].
    pub fn append_chunk(&mut self, chunk: StreamChunk) {
        if self.status.is_terminal() {
            warn!(
                "dropping chunk for terminal conversation {} ({:?})",
                self.id, self.status
            );
            return;
        }
        if let StreamChunk::TextDelta { text } = &chunk {
            self.full_text.push_str(text);
        }
        self.chunks.push(chunk);
    }

    /// Drain the chunk buffer in one observable step.
    pub fn drain_chunks(&mut self) -> Vec<StreamChunk> {
        std::mem::take(&mut self.chunks)
    }

    /// Snapshot for a consumer poll, draining the buffer.
    pub fn take_updates(&mut self) -> Updates {
        Updates {
            chunks: self.drain_chunks(),
            status: self.status,
            full_text: self.full_text.clone(),
        }
    }

    pub fn add_tokens(&mut self, tokens_in: u64, tokens_out: u64) {
        self.tokens_in += tokens_in;
        self.tokens_out += tokens_out;
    }

    // ── Transitions ───────────────────────────────────────────────────────

    /// Normal completion: emits the single `Finish` chunk and seals the
    /// record. No-op when already terminal.
    pub fn complete(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.chunks.push(StreamChunk::Finish);
        self.status = ConversationStatus::Completed;
    }

    /// Fatal failure: emits the single `Error` chunk, removes a trailing
    /// unprocessed `user` message so resubmission does not double it, and
    /// seals the record. No-op when already terminal.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.remove_trailing_user();
        self.chunks.push(StreamChunk::Error {
            message: message.into(),
        });
        self.status = ConversationStatus::Error;
    }

    /// Cancellation observed: seals the record without a chunk.
    pub fn mark_aborted(&mut self) {
        if self.status.is_terminal() {
            return;
        }
        self.status = ConversationStatus::Aborted;
    }

    /// Reopen a terminal conversation for a follow-up or resubmitted
    /// prompt: fresh cancel token, fresh loop state, status back to
    /// streaming. Returns `false` (and does nothing) while a loop is still
    /// running (the record has a single writer at a time).
    pub fn reopen(&mut self) -> bool {
        if self.status == ConversationStatus::Streaming {
            return false;
        }
        self.status = ConversationStatus::Streaming;
        self.cancel = CancelToken::new();
        self.loop_state = LoopState::default();
        true
    }

    fn remove_trailing_user(&mut self) {
        if self
            .messages
            .last()
            .is_some_and(|m| m.role == MessageRole::User)
        {
            self.messages.pop();
        }
    }

    // ── Trimming ──────────────────────────────────────────────────────────

    /// Bound the history to `max` messages, dropping the oldest first.
    ///
    /// Cuts only at `user`-message boundaries: the retained suffix starts
    /// at the earliest `user` message that fits the bound. When the history
    /// somehow has no user boundary in range (it should not, given the
    /// alternation invariant), the minimal plain prefix is dropped so the
    /// bound still holds.
    pub fn trim_history(&mut self, max: usize) {
        trim_messages(&mut self.messages, max);
    }
}

pub(crate) fn trim_messages(messages: &mut Vec<Message>, max: usize) {
    if messages.len() <= max {
        return;
    }
    let excess = messages.len() - max;
    match (excess..messages.len()).find(|&i| messages[i].role == MessageRole::User) {
        Some(start) => {
            messages.drain(..start);
        }
        None => {
            warn!("history has no user boundary to trim at; dropping plain prefix");
            messages.drain(..excess);
        }
    }
}
