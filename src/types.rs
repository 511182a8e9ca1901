//! Core type definitions for the page-audit agent.
//!
//! This module contains the data structures shared by every subsystem of the
//! orchestrator. They fall into three groups:
//!
//! # Message System
//!
//! The conversation history the model sees is built from structured parts:
//!
//! - [`Message`]: one conversation entry with a role and ordered content
//! - [`MessageRole`]: who produced the entry (`User` or `Assistant`)
//! - [`ContentBlock`]: a typed content part (text, tool use, tool result)
//! - [`TextBlock`], [`ToolUseBlock`], [`ToolResultBlock`]: the part payloads
//!
//! The history invariant the whole crate is built around: an assistant
//! message that contains `tool_use` parts also contains the matching
//! `tool_result` parts before any later `user` message. Nothing in this
//! module enforces that on its own ([`crate::conversation`] does), but the
//! shapes here make the invariant expressible.
//!
//! # Outbound Stream
//!
//! - [`StreamChunk`]: the tagged union buffered per conversation and drained
//!   by consumer polls. Exactly one terminal chunk (`Finish` or `Error`) is
//!   emitted per conversation unless it is aborted.
//!
//! # Cancellation
//!
//! - [`CancelToken`]: a one-shot, idempotent flag observable both by
//!   synchronous checks (between loop iterations) and by awaits
//!   (`cancelled().await` inside script-queue waits).

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

// ============================================================================
// MESSAGE SYSTEM
// ============================================================================

/// Role of a conversation message.
///
/// The model wire format only ever sees `user` and `assistant`; the system
/// prompt travels as a top-level request field, not as a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// A typed content part within a message.
///
/// Serialized with a `type` tag matching the model wire format, so a
/// `Vec<ContentBlock>` can be dropped straight into a request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text(TextBlock),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
}

impl ContentBlock {
    /// Convenience constructor for a text part.
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text(TextBlock::new(text))
    }

    /// Convenience constructor for a tool-result part.
    pub fn tool_result(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        ContentBlock::ToolResult(ToolResultBlock {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        })
    }
}

/// Plain text content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
}

impl TextBlock {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// A model request to execute a tool.
///
/// `id` is unique within its message and is the key that ties the eventual
/// [`ToolResultBlock`] back to this request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

impl ToolUseBlock {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }
}

/// The outcome of a tool execution, fed back to the model.
///
/// `content` is the serialized result payload; `is_error` marks results the
/// model should treat as failures (and which count toward loop detection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl ToolResultBlock {
    pub fn new(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error: true,
        }
    }
}

/// One entry in a conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
}

impl Message {
    /// Create a message with an explicit role and content blocks.
    pub fn new(role: MessageRole, content: Vec<ContentBlock>) -> Self {
        Self { role, content }
    }

    /// Create a user message from plain text.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Create an assistant message from content blocks.
    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
        }
    }

    /// Ids of the `tool_use` parts in this message, in order.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolUse(t) => Some(t.id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// True when every `tool_use` part has a matching `tool_result` part
    /// within this same message.
    pub fn tool_uses_resolved(&self) -> bool {
        self.tool_use_ids().iter().all(|id| {
            self.content.iter().any(|block| {
                matches!(block, ContentBlock::ToolResult(r) if r.tool_use_id == *id)
            })
        })
    }
}

// ============================================================================
// OUTBOUND STREAM CHUNKS
// ============================================================================

/// A single outbound event buffered for consumer polling.
///
/// Chunks are appended by the orchestrator in observation order and drained
/// atomically by [`crate::Orchestrator::poll`]. The serialized form uses a
/// `type` tag so a UI can switch on it directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    /// Incremental assistant text.
    TextDelta { text: String },
    /// A completed tool request (arguments fully parsed).
    ToolCall {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    /// The result of a dispatched tool call.
    ToolResult {
        id: String,
        name: String,
        result: serde_json::Value,
    },
    /// A fatal or advisory error description.
    Error { message: String },
    /// Terminal marker: the conversation completed normally.
    Finish,
}

// ============================================================================
// CANCELLATION
// ============================================================================

/// One-shot cancellation flag shared across a conversation's tasks.
///
/// The flag is checked synchronously at loop boundaries and awaited inside
/// long suspensions via
/// [`CancelToken::cancelled`], which resolves once `cancel()` has been
/// called. `cancel()` is idempotent; cloning shares the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the token. Safe to call multiple times.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Non-blocking check.
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves when the token fires. Returns immediately if it already has.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register with the Notify before the final flag check, so a
        // cancel() landing between the check and the await is not lost.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}
