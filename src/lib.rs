//! # Page-Audit Agent
//!
//! A streaming, multi-turn conversation orchestrator for a browser-resident
//! security-analysis agent. A user prompt is handed to an LLM that
//! investigates the currently loaded page through a fixed set of tools:
//! network-request inspection, in-page code execution, data injection,
//! statistics. Tool results feed back into the model until it produces
//! a final answer. The answer and every intermediate event stream out to a
//! polling consumer as typed chunks.
//!
//! ## Key Pieces
//!
//! - **Streaming Model Client**: one SSE request per agent turn, decoded
//!   incrementally into typed protocol events
//! - **Tool Execution Engine**: eight tools over the page's captured
//!   network traffic and a page-side script runner
//! - **Script Execution Queue**: per-target FIFO broker with hard
//!   timeouts, so tool handlers and the in-page runner never talk directly
//! - **Conversation State**: structured tool_use / tool_result history,
//!   buffered outbound chunks, loop detection, cancellation
//!
//! ## Example
//!
//! ```rust,no_run
//! use page_audit::{
//!     AgentConfig, HttpModelClient, ModelConfig, NetworkCache, Orchestrator, ScriptQueue,
//!     ToolExecutor,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let model = Arc::new(HttpModelClient::new(ModelConfig::from_env()?)?);
//!     let cache = Arc::new(NetworkCache::new());
//!     let scripts = Arc::new(ScriptQueue::default());
//!     let tools = Arc::new(ToolExecutor::new(cache.clone(), scripts.clone()));
//!
//!     let agent = Orchestrator::new(
//!         model,
//!         tools,
//!         AgentConfig::builder()
//!             .system_prompt("You are a web security analyst.")
//!             .build()?,
//!     );
//!
//!     agent.start("conv-1", "Does this page leak credentials?", "tab-1")?;
//!     loop {
//!         let updates = agent.poll("conv-1")?;
//!         for chunk in &updates.chunks {
//!             println!("{chunk:?}");
//!         }
//!         if updates.status.is_terminal() {
//!             break;
//!         }
//!         tokio::time::sleep(std::time::Duration::from_millis(100)).await;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! The page-side runner collaborator drives the other half of the script
//! queue: it polls [`ScriptQueue::dequeue`] for work and reports outcomes
//! with [`ScriptQueue::resolve`] / [`ScriptQueue::reject`]; the network
//! capture collaborator feeds [`NetworkCache::insert`].
//!
//! ## Architecture
//!
//! - **client**: model-endpoint seam ([`ModelClient`]) and the production
//!   SSE streaming implementation
//! - **orchestrator**: the agent loop and the conversation registry behind
//!   the consumer API (`start` / `poll` / `abort` / `cleanup`)
//! - **conversation**: per-conversation record, history invariants,
//!   trimming, chunk buffering
//! - **tools**: the tool registry and its eight handlers
//! - **script**: the pending-execution broker between tools and the page
//! - **cache**: network-entry records and the read-only query store
//! - **utils**: SSE frame parsing and content-block assembly
//! - **config**: endpoint and orchestrator configuration
//! - **error**: the error taxonomy
//! - **retry**: backoff for the connect-phase model request

/// Network-entry records and the in-memory query store the tools run over.
mod cache;

/// Model client: the `ModelClient` seam and the streaming HTTP implementation.
mod client;

/// Endpoint and orchestrator configuration with env-var overrides.
mod config;

/// Per-conversation state: history, chunk buffer, lifecycle, trimming.
mod conversation;

/// Error types and conversions used across all public APIs.
mod error;

/// The agent loop and the process-wide conversation registry.
mod orchestrator;

/// The script-execution broker between tool handlers and the page runner.
mod script;

/// The tool registry and its handlers.
mod tools;

/// Message, chunk, and cancellation primitives.
mod types;

/// SSE parsing and content-block assembly internals.
mod utils;

/// Connect-phase retry policy for the model endpoint.
pub mod retry;

// --- Consumer API ---

pub use orchestrator::Orchestrator;

// --- Conversation state ---

pub use conversation::{Conversation, ConversationStatus, LoopState, Updates};

// --- Model client ---

pub use client::{EventStream, HttpModelClient, ModelClient, ModelRequest, build_wire_messages};

// --- Configuration ---

pub use config::{
    AgentConfig, AgentConfigBuilder, DEFAULT_MAX_HISTORY, DEFAULT_MAX_TURNS,
    DEFAULT_SCRIPT_TIMEOUT, ModelConfig, ModelConfigBuilder, get_api_key, get_base_url, get_model,
};

// --- Tools and collaborators ---

pub use cache::{
    CacheStatistics, EntryFilter, EntryMetadata, NetworkCache, NetworkEntry, RequestRecord,
    ResponseRecord, Timing,
};
pub use script::{QueuedScript, ScriptQueue};
pub use tools::{PAGE_NAMESPACE, TOOL_NAMES, ToolExecutor, is_failure_result};

// --- Core types ---

pub use error::{Error, Result};
pub use types::{
    CancelToken, ContentBlock, Message, MessageRole, StreamChunk, TextBlock, ToolResultBlock,
    ToolUseBlock,
};
pub use utils::{BlockKind, BlockOutcome, ProtocolEvent, SseParser, StopReason, TurnAccumulator};

/// Convenience module containing the most commonly used types.
/// Import with `use page_audit::prelude::*;`.
pub mod prelude {
    pub use crate::{
        AgentConfig, CancelToken, ContentBlock, ConversationStatus, Error, HttpModelClient,
        Message, ModelClient, ModelConfig, NetworkCache, NetworkEntry, Orchestrator, Result,
        ScriptQueue, StreamChunk, ToolExecutor, Updates,
    };
}
