//! Model client: one streaming request per agent turn.
//!
//! [`ModelClient`] is the seam between the orchestrator and the model
//! endpoint: the orchestrator only ever sees a lazy, typed
//! [`EventStream`], which makes the loop testable against a scripted mock.
//! [`HttpModelClient`] is the production implementation: it POSTs to the
//! endpoint's `/v1/messages` route with `stream: true` and adapts the SSE
//! byte stream through [`SseParser`] into protocol events.
//!
//! # Failure semantics
//!
//! - Non-2xx response: the body is read and the call fails with
//!   [`Error::Api`] carrying status and body.
//! - Transient connect-phase failures (network errors, 429, 5xx) are
//!   retried with backoff before giving up; once the stream is open nothing
//!   is retried.
//! - Mid-stream transport failures surface as [`Error::Stream`] items on
//!   the event stream.
//! - Cancellation is the caller's job: dropping the stream aborts the
//!   underlying request.

use crate::config::ModelConfig;
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::types::{ContentBlock, Message, MessageRole};
use crate::utils::{ProtocolEvent, SseParser};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::stream::{Stream, StreamExt};
use log::debug;
use serde_json::{Value, json};
use std::pin::Pin;

/// Wire protocol version sent with every request.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Stream of typed protocol events from one model turn.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<ProtocolEvent>> + Send>>;

/// Everything one model turn needs.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    pub system: String,
    /// Tool definitions in the endpoint's schema form
    /// (`{name, description, input_schema}` objects).
    pub tools: Vec<Value>,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// The model endpoint seam. One call = one streaming turn.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream(&self, request: ModelRequest) -> Result<EventStream>;
}

/// Production client for the HTTPS model endpoint.
pub struct HttpModelClient {
    config: ModelConfig,
    retry: RetryPolicy,
    http: reqwest::Client,
}

impl HttpModelClient {
    pub fn new(config: ModelConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            // Connect-phase deadline only. No overall timeout: a streaming
            // response legitimately stays open for the whole turn.
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(Error::Http)?;

        Ok(Self {
            config,
            retry: RetryPolicy::default(),
            http,
        })
    }

    /// Override the connect-phase retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn build_body(&self, request: &ModelRequest) -> Value {
        let mut body = json!({
            "model": self.config.model(),
            "messages": build_wire_messages(&request.messages),
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
            "stream": true,
        });
        if !request.system.is_empty() {
            body["system"] = json!(request.system);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(request.tools);
        }
        body
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn stream(&self, request: ModelRequest) -> Result<EventStream> {
        let url = format!("{}/v1/messages", self.config.base_url());
        let body = self.build_body(&request);
        debug!(
            "model request: {} messages, {} tools",
            request.messages.len(),
            request.tools.len()
        );

        let response = retry_with_backoff(self.retry.clone(), || async {
            let resp = self
                .http
                .post(&url)
                .header("x-api-key", self.config.api_key())
                .header("anthropic-version", ANTHROPIC_VERSION)
                .header("content-type", "application/json")
                .json(&body)
                .send()
                .await
                .map_err(Error::Http)?;

            if !resp.status().is_success() {
                let status = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                return Err(Error::api(status, text));
            }
            Ok(resp)
        })
        .await?;

        // SSE lines split anywhere across HTTP chunks; SseParser carries the
        // remainder forward and yields only events completed by each chunk.
        let events = response
            .bytes_stream()
            .scan(SseParser::new(), |parser, chunk| {
                let out: Vec<Result<ProtocolEvent>> = match chunk {
                    Ok(bytes) => parser.feed(&bytes).into_iter().map(Ok).collect(),
                    Err(e) => vec![Err(Error::stream(format!("transport failure: {e}")))],
                };
                futures::future::ready(Some(out))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(events))
    }
}

/// Convert internal history into the endpoint's message array.
///
/// Internally an assistant turn keeps its `tool_result` parts inside the
/// same [`Message`] as the `tool_use` parts that produced them (that is the
/// pairing invariant). The wire format wants them as a follow-up `user`
/// message, so each assistant entry splits into:
///
/// 1. `assistant` with its text and `tool_use` blocks, then
/// 2. `user` with the `tool_result` blocks, when any exist.
pub fn build_wire_messages(messages: &[Message]) -> Vec<Value> {
    let mut out = Vec::new();

    for message in messages {
        match message.role {
            MessageRole::User => {
                let content: Vec<Value> = message
                    .content
                    .iter()
                    .filter_map(|block| match block {
                        ContentBlock::Text(t) => Some(json!({
                            "type": "text",
                            "text": t.text,
                        })),
                        _ => None,
                    })
                    .collect();
                out.push(json!({ "role": "user", "content": content }));
            }
            MessageRole::Assistant => {
                let mut assistant_content = Vec::new();
                let mut results = Vec::new();

                for block in &message.content {
                    match block {
                        ContentBlock::Text(t) => assistant_content.push(json!({
                            "type": "text",
                            "text": t.text,
                        })),
                        ContentBlock::ToolUse(t) => assistant_content.push(json!({
                            "type": "tool_use",
                            "id": t.id,
                            "name": t.name,
                            "input": t.input,
                        })),
                        ContentBlock::ToolResult(r) => {
                            let mut result = json!({
                                "type": "tool_result",
                                "tool_use_id": r.tool_use_id,
                                "content": r.content,
                            });
                            if r.is_error {
                                result["is_error"] = json!(true);
                            }
                            results.push(result);
                        }
                    }
                }

                if !assistant_content.is_empty() {
                    out.push(json!({ "role": "assistant", "content": assistant_content }));
                }
                if !results.is_empty() {
                    out.push(json!({ "role": "user", "content": results }));
                }
            }
        }
    }

    out
}
