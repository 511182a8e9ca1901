//! Streaming utilities: SSE frame parsing and content-block assembly.
//!
//! This module handles the two low-level jobs of the model client:
//!
//! # Job 1: SSE (Server-Sent Events) Parsing
//!
//! The model endpoint streams named events:
//!
//! ```text
//! event: message_start
//! data: {"type":"message_start","message":{"usage":{"input_tokens":12}}}
//!
//! event: content_block_delta
//! data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}
//!
//! ```
//!
//! `event:` lines set the current event name, `data:` lines carry JSON, and
//! a blank line completes a record. HTTP chunk boundaries fall anywhere,
//! even mid-line, so [`SseParser`] is fed raw bytes and carries the
//! trailing partial line across reads. Invalid JSON on a data line is
//! logged and skipped; the stream continues. Event names outside the
//! supported subset are ignored.
//!
//! # Job 2: Content-Block Assembly
//!
//! Tool-use arguments arrive as incremental JSON fragments keyed by block
//! index, interleaved with text deltas:
//!
//! ```text
//! content_block_start  index=1  tool_use{id:"tu_1", name:"search_requests"}
//! content_block_delta  index=1  partial_json: "{\"ur"
//! content_block_delta  index=1  partial_json: "l\":\"/api\"}"
//! content_block_stop   index=1
//! ```
//!
//! [`TurnAccumulator`] keeps a per-index buffer and parses it exactly once,
//! at `content_block_stop`. A successful parse yields a completed
//! [`ToolUseBlock`]; a failed parse yields [`BlockOutcome::ToolParseError`]
//! and no tool call; the turn continues with whatever other blocks are
//! usable.

use crate::types::{ContentBlock, TextBlock, ToolUseBlock};
use log::{debug, warn};
use serde_json::Value;
use std::collections::BTreeMap;

// ============================================================================
// PROTOCOL EVENTS
// ============================================================================

/// The kind of content block announced by `content_block_start`.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    Text,
    ToolUse { id: String, name: String },
}

/// Why the model stopped generating, from `message_delta.delta.stop_reason`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other(String),
}

impl StopReason {
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "end_turn" => StopReason::EndTurn,
            "tool_use" => StopReason::ToolUse,
            "max_tokens" => StopReason::MaxTokens,
            other => StopReason::Other(other.to_string()),
        }
    }
}

/// A typed protocol delta decoded from one SSE frame.
///
/// Exactly the wire subset the orchestrator consumes; anything else the
/// endpoint sends (`ping`, future event names) never reaches this enum.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// `message_start`: input-token usage for the request.
    UsageStart { input_tokens: u64 },
    /// `content_block_start`: a new text or tool-use block at `index`.
    BlockStart { index: u32, kind: BlockKind },
    /// `content_block_delta` with `text_delta`.
    TextDelta { text: String },
    /// `content_block_delta` with `input_json_delta`.
    ToolArgsDelta { index: u32, partial_json: String },
    /// `content_block_stop`.
    BlockStop { index: u32 },
    /// `message_delta` usage: output tokens generated so far.
    Usage { output_tokens: u64 },
    /// `message_delta` stop reason.
    StopReason(StopReason),
    /// `message_stop`: the turn is over.
    MessageStop,
}

// ============================================================================
// SSE PARSER
// ============================================================================

/// Incremental SSE decoder.
///
/// Feed it raw response bytes as they arrive; it yields the protocol events
/// completed by those bytes. State carried across feeds:
///
/// - the trailing partial line (HTTP chunks split anywhere)
/// - the current record's `event:` name and accumulated `data:` lines
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event_name: Option<String>,
    data_lines: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk of response bytes, returning every event completed
    /// by it (possibly none, possibly several).
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ProtocolEvent> {
        // Lossy conversion tolerates a UTF-8 sequence split across chunks
        // only at line granularity; the endpoint emits ASCII-framed lines so
        // multi-byte payload characters stay within a data line.
        self.buffer.push_str(&String::from_utf8_lossy(bytes));

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim_end_matches('\r').to_string();
            self.buffer.drain(..=pos);
            events.extend(self.take_line(&line));
        }
        events
    }

    fn take_line(&mut self, line: &str) -> Vec<ProtocolEvent> {
        if line.is_empty() {
            // Blank line: the record is complete.
            let event_name = self.event_name.take();
            let data = self.data_lines.join("\n");
            self.data_lines.clear();

            if let Some(name) = event_name {
                if !data.is_empty() {
                    return parse_frame(&name, &data);
                }
            }
            return Vec::new();
        }

        if let Some(name) = line.strip_prefix("event:") {
            self.event_name = Some(name.trim().to_string());
        } else if let Some(data) = line.strip_prefix("data:") {
            self.data_lines.push(data.trim_start().to_string());
        }
        // Comment lines (":keepalive") and unknown fields are ignored.
        Vec::new()
    }
}

/// Map one completed SSE frame to protocol events.
///
/// `message_delta` can carry both usage and a stop reason, hence the Vec.
/// Unknown event names and malformed JSON produce no events.
fn parse_frame(event_name: &str, data: &str) -> Vec<ProtocolEvent> {
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            warn!("skipping malformed SSE data for event {event_name}: {e}");
            return Vec::new();
        }
    };

    match event_name {
        "message_start" => {
            let input_tokens = value["message"]["usage"]["input_tokens"]
                .as_u64()
                .unwrap_or(0);
            vec![ProtocolEvent::UsageStart { input_tokens }]
        }
        "content_block_start" => {
            let index = value["index"].as_u64().unwrap_or(0) as u32;
            let block = &value["content_block"];
            let kind = if block["type"].as_str() == Some("tool_use") {
                BlockKind::ToolUse {
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                }
            } else {
                BlockKind::Text
            };
            vec![ProtocolEvent::BlockStart { index, kind }]
        }
        "content_block_delta" => {
            let index = value["index"].as_u64().unwrap_or(0) as u32;
            let delta = &value["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => vec![ProtocolEvent::TextDelta {
                    text: delta["text"].as_str().unwrap_or("").to_string(),
                }],
                "input_json_delta" => vec![ProtocolEvent::ToolArgsDelta {
                    index,
                    partial_json: delta["partial_json"].as_str().unwrap_or("").to_string(),
                }],
                other => {
                    debug!("ignoring content_block_delta of type {other:?}");
                    Vec::new()
                }
            }
        }
        "content_block_stop" => {
            let index = value["index"].as_u64().unwrap_or(0) as u32;
            vec![ProtocolEvent::BlockStop { index }]
        }
        "message_delta" => {
            let mut events = Vec::new();
            if let Some(output_tokens) = value["usage"]["output_tokens"].as_u64() {
                events.push(ProtocolEvent::Usage { output_tokens });
            }
            if let Some(reason) = value["delta"]["stop_reason"].as_str() {
                events.push(ProtocolEvent::StopReason(StopReason::from_wire(reason)));
            }
            events
        }
        "message_stop" => vec![ProtocolEvent::MessageStop],
        other => {
            debug!("ignoring SSE event {other:?}");
            Vec::new()
        }
    }
}

// ============================================================================
// TURN ACCUMULATOR
// ============================================================================

/// Outcome of feeding one event to the accumulator.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockOutcome {
    /// Nothing finished on this event.
    None,
    /// A tool-use block closed with well-formed arguments.
    ToolComplete(ToolUseBlock),
    /// A tool-use block closed but its accumulated JSON never parsed; no
    /// tool call is produced for it.
    ToolParseError { index: u32, error: String },
}

#[derive(Debug)]
enum BlockState {
    Text { text: String },
    Tool { id: String, name: String, args: String },
}

/// Assembles a single assistant turn out of protocol events.
///
/// This is a **stateful accumulator**: blocks open at `BlockStart`, grow on
/// deltas, and are committed in wire order when they stop. Tool
/// arguments are accumulated as a raw string and parsed as JSON exactly
/// once, at the block's stop (streaming may split JSON at any byte). An
/// empty argument buffer parses as `{}`.
///
/// Call [`TurnAccumulator::finish`] after `message_stop` to take the
/// ordered content parts of the assembled assistant message. Text blocks
/// the stream never closed are flushed; tool blocks the stream never closed
/// are dropped (their arguments are necessarily incomplete).
#[derive(Debug, Default)]
pub struct TurnAccumulator {
    open: BTreeMap<u32, BlockState>,
    /// Index of the text block currently receiving unindexed text deltas.
    open_text: Option<u32>,
    /// Synthetic index for text that arrives with no preceding block start.
    next_synthetic: u32,
    parts: Vec<ContentBlock>,
}

impl TurnAccumulator {
    pub fn new() -> Self {
        Self {
            next_synthetic: u32::MAX,
            ..Self::default()
        }
    }

    /// Feed one protocol event. Only block-level events mutate state here;
    /// usage and stop-reason events belong to the caller.
    pub fn process(&mut self, event: &ProtocolEvent) -> BlockOutcome {
        match event {
            ProtocolEvent::BlockStart { index, kind } => {
                match kind {
                    BlockKind::Text => {
                        self.open.insert(*index, BlockState::Text { text: String::new() });
                        self.open_text = Some(*index);
                    }
                    BlockKind::ToolUse { id, name } => {
                        self.open.insert(
                            *index,
                            BlockState::Tool {
                                id: id.clone(),
                                name: name.clone(),
                                args: String::new(),
                            },
                        );
                    }
                }
                BlockOutcome::None
            }
            ProtocolEvent::TextDelta { text } => {
                self.open_text_buffer().push_str(text);
                BlockOutcome::None
            }
            ProtocolEvent::ToolArgsDelta { index, partial_json } => {
                match self.open.get_mut(index) {
                    Some(BlockState::Tool { args, .. }) => args.push_str(partial_json),
                    _ => warn!("argument delta for unknown tool block {index}"),
                }
                BlockOutcome::None
            }
            ProtocolEvent::BlockStop { index } => self.stop_block(*index),
            _ => BlockOutcome::None,
        }
    }

    /// Take the assembled content parts, flushing any text block the stream
    /// left open.
    pub fn finish(mut self) -> Vec<ContentBlock> {
        let open = std::mem::take(&mut self.open);
        for (index, state) in open {
            match state {
                BlockState::Text { text } if !text.is_empty() => {
                    self.parts.push(ContentBlock::Text(TextBlock::new(text)));
                }
                BlockState::Text { .. } => {}
                BlockState::Tool { name, .. } => {
                    warn!("dropping unterminated tool block {index} ({name})");
                }
            }
        }
        self.parts
    }

    fn stop_block(&mut self, index: u32) -> BlockOutcome {
        if self.open_text == Some(index) {
            self.open_text = None;
        }
        match self.open.remove(&index) {
            Some(BlockState::Text { text }) => {
                if !text.is_empty() {
                    self.parts.push(ContentBlock::Text(TextBlock::new(text)));
                }
                BlockOutcome::None
            }
            Some(BlockState::Tool { id, name, args }) => {
                let input: Value = if args.is_empty() {
                    serde_json::json!({})
                } else {
                    match serde_json::from_str(&args) {
                        Ok(v) => v,
                        Err(e) => {
                            warn!("tool block {index} ({name}) has unparsable arguments: {e}");
                            return BlockOutcome::ToolParseError {
                                index,
                                error: e.to_string(),
                            };
                        }
                    }
                };
                let block = ToolUseBlock::new(id, name, input);
                self.parts.push(ContentBlock::ToolUse(block.clone()));
                BlockOutcome::ToolComplete(block)
            }
            None => BlockOutcome::None,
        }
    }

    /// The text buffer unindexed deltas append to, creating a synthetic
    /// block when the stream never announced one.
    fn open_text_buffer(&mut self) -> &mut String {
        let index = match self.open_text {
            Some(index) if matches!(self.open.get(&index), Some(BlockState::Text { .. })) => index,
            _ => {
                let index = self.next_synthetic;
                self.next_synthetic -= 1;
                self.open.insert(index, BlockState::Text { text: String::new() });
                self.open_text = Some(index);
                index
            }
        };
        match self.open.get_mut(&index) {
            Some(BlockState::Text { text }) => text,
            _ => unreachable!("open_text always points at a text block"),
        }
    }
}
