//! # Tool execution engine
//!
//! The model investigates a page through a fixed registry of tools. Each
//! tool takes a JSON input object, runs against the conversation's target
//! (its browsing context), and produces a JSON-serializable result.
//!
//! ## Error discipline
//!
//! Two distinct failure channels, deliberately kept apart:
//!
//! - **Recoverable** problems (a missing `requestId`, an out-of-range
//!   offset, a script that threw) come back as `Ok` values shaped
//!   `{"error": ...}`. They are fed to the model as ordinary tool results
//!   so it can correct itself, and they count toward loop detection.
//! - **Raised** errors (an unregistered tool name, cancellation) come
//!   back as `Err`. The orchestrator converts unknown-tool errors into an
//!   `is_error` tool result naming the available tools, and lets
//!   cancellation unwind the loop.
//!
//! ## Tool inventory
//!
//! | tool | backing |
//! |------|---------|
//! | `get_network_requests`, `get_request_details`, `get_request_body_chunk`, `search_requests`, `search_request_content`, `get_cache_statistics` | read-only queries over [`NetworkCache`] |
//! | `execute_javascript`, `expose_request_data` | deferred execution through [`ScriptQueue`] |
//!
//! All tools receive the `target_id` captured at conversation start; the
//! model cannot point them at another tab.

use crate::cache::{EntryFilter, NetworkCache, NetworkEntry};
use crate::script::ScriptQueue;
use crate::types::CancelToken;
use crate::{Error, Result};
use log::debug;
use serde_json::{Value, json};
use std::sync::Arc;

/// The page-global namespace `expose_request_data` publishes under.
pub const PAGE_NAMESPACE: &str = "__pageAudit";

/// Names of every registered tool, in schema order.
pub const TOOL_NAMES: [&str; 8] = [
    "get_network_requests",
    "get_request_details",
    "get_request_body_chunk",
    "search_requests",
    "search_request_content",
    "expose_request_data",
    "get_cache_statistics",
    "execute_javascript",
];

/// Dispatches model-requested tool calls against one target.
pub struct ToolExecutor {
    cache: Arc<NetworkCache>,
    scripts: Arc<ScriptQueue>,
}

impl ToolExecutor {
    pub fn new(cache: Arc<NetworkCache>, scripts: Arc<ScriptQueue>) -> Self {
        Self { cache, scripts }
    }

    /// Tool definitions in the model endpoint's schema form.
    pub fn definitions() -> Vec<Value> {
        vec![
            json!({
                "name": "get_network_requests",
                "description": "List captured network requests for the current page, newest last. Paginate with offset.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "limit": {"type": "integer", "description": "Max requests to return (default 10, cap 20)"},
                        "offset": {"type": "integer", "description": "Number of requests to skip (default 0)"}
                    }
                }
            }),
            json!({
                "name": "get_request_details",
                "description": "Full record of one captured request, with bodies truncated to a preview size.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "requestId": {"type": "string", "description": "Id from a request summary"},
                        "bodyPreviewSize": {"type": "integer", "description": "Body preview length in characters (default 500, max 1500)"}
                    },
                    "required": ["requestId"]
                }
            }),
            json!({
                "name": "get_request_body_chunk",
                "description": "Read a slice of a request or response body, for bodies larger than the details preview.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "requestId": {"type": "string"},
                        "bodyType": {"type": "string", "enum": ["request", "response"]},
                        "offset": {"type": "integer", "description": "Character offset to start from (default 0)"},
                        "length": {"type": "integer", "description": "Characters to return (default 2000, max 5000)"}
                    },
                    "required": ["requestId", "bodyType"]
                }
            }),
            json!({
                "name": "search_requests",
                "description": "Filter captured requests by URL substring, HTTP method, and/or status range. Returns at most 10.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "url": {"type": "string", "description": "Case-insensitive URL substring"},
                        "method": {"type": "string"},
                        "minStatus": {"type": "integer"},
                        "maxStatus": {"type": "integer"}
                    }
                }
            }),
            json!({
                "name": "search_request_content",
                "description": "Search captured request URLs and bodies for a string.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "searchIn": {"type": "string", "enum": ["all", "url", "request_body", "response_body"], "description": "Where to search (default all)"},
                        "limit": {"type": "integer", "description": "Max results (default 10, max 15)"}
                    },
                    "required": ["query"]
                }
            }),
            json!({
                "name": "expose_request_data",
                "description": "Publish selected captured requests into the page as a global variable for in-page analysis.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "requestIds": {"type": "array", "items": {"type": "string"}},
                        "variableName": {"type": "string", "description": "Variable name under the page namespace (default \"data\")"}
                    },
                    "required": ["requestIds"]
                }
            }),
            json!({
                "name": "get_cache_statistics",
                "description": "Aggregate counts over the captured requests: totals by method, status, and type.",
                "input_schema": {"type": "object", "properties": {}}
            }),
            json!({
                "name": "execute_javascript",
                "description": "Run JavaScript in the page and return its result plus captured console output.",
                "input_schema": {
                    "type": "object",
                    "properties": {
                        "code": {"type": "string"}
                    },
                    "required": ["code"]
                }
            }),
        ]
    }

    /// Execute one tool call.
    ///
    /// # Errors
    ///
    /// - [`Error::Tool`] for an unregistered tool name (the message lists
    ///   the available tools)
    /// - [`Error::Cancelled`] when the conversation's token fires during a
    ///   script-queue await
    ///
    /// Everything else, including script timeouts and target teardown,
    /// returns `Ok` with an `{"error": ...}` payload.
    pub async fn execute(
        &self,
        name: &str,
        input: &Value,
        target_id: &str,
        cancel: &CancelToken,
    ) -> Result<Value> {
        debug!("executing tool {name} for target {target_id}");
        match name {
            "get_network_requests" => Ok(self.get_network_requests(input, target_id)),
            "get_request_details" => Ok(self.get_request_details(input, target_id)),
            "get_request_body_chunk" => Ok(self.get_request_body_chunk(input, target_id)),
            "search_requests" => Ok(self.search_requests(input, target_id)),
            "search_request_content" => Ok(self.search_request_content(input, target_id)),
            "expose_request_data" => self.expose_request_data(input, target_id, cancel).await,
            "get_cache_statistics" => Ok(self.get_cache_statistics(target_id)),
            "execute_javascript" => self.execute_javascript(input, target_id, cancel).await,
            unknown => Err(Error::tool(format!(
                "unknown tool '{unknown}'; available tools: {}",
                TOOL_NAMES.join(", ")
            ))),
        }
    }

    // ── Network cache tools ───────────────────────────────────────────────

    fn get_network_requests(&self, input: &Value, target_id: &str) -> Value {
        let limit = match bounded_usize(input, "limit", 10, 20) {
            Ok(v) => v,
            Err(e) => return e,
        };
        let offset = match bounded_usize(input, "offset", 0, usize::MAX) {
            Ok(v) => v,
            Err(e) => return e,
        };

        let entries = self.cache.entries_for_target(target_id);
        let total = entries.len();
        let page: Vec<Value> = entries
            .iter()
            .skip(offset)
            .take(limit)
            .map(summarize)
            .collect();
        let returned = page.len();

        json!({
            "total": total,
            "returned": returned,
            "offset": offset,
            "hasMore": offset + returned < total,
            "requests": page,
        })
    }

    fn get_request_details(&self, input: &Value, target_id: &str) -> Value {
        // A missing or empty requestId flows into the lookup so the model
        // sees the same "Request not found" shape either way.
        let request_id = input["requestId"].as_str().unwrap_or("");
        let preview = match bounded_usize(input, "bodyPreviewSize", 500, 1500) {
            Ok(v) => v,
            Err(e) => return e,
        };

        let Some(entry) = self.cache.entry(target_id, request_id) else {
            return json!({ "error": format!("Request not found: {request_id}") });
        };

        let mut record = serde_json::to_value(&entry).unwrap_or_else(|_| json!({}));
        truncate_body(&mut record["request"]["body"], preview);
        truncate_body(&mut record["response"]["body"], preview);
        record
    }

    fn get_request_body_chunk(&self, input: &Value, target_id: &str) -> Value {
        let request_id = input["requestId"].as_str().unwrap_or("");
        let body_type = match input["bodyType"].as_str() {
            Some(t @ ("request" | "response")) => t,
            _ => {
                return json!({ "error": "bodyType must be \"request\" or \"response\"" });
            }
        };
        let offset = match bounded_usize(input, "offset", 0, usize::MAX) {
            Ok(v) => v,
            Err(e) => return e,
        };
        let length = match bounded_usize(input, "length", 2000, 5000) {
            Ok(v) => v,
            Err(e) => return e,
        };

        let Some(entry) = self.cache.entry(target_id, request_id) else {
            return json!({ "error": format!("Request not found: {request_id}") });
        };

        let body = match body_type {
            "request" => entry.request.body.as_deref().unwrap_or(""),
            _ => entry.response.body.as_deref().unwrap_or(""),
        };

        // Character-based slicing: offsets stay meaningful to the model and
        // never land inside a UTF-8 sequence.
        let total_size = body.chars().count();
        let chunk: String = body.chars().skip(offset).take(length).collect();
        let chunk_size = chunk.chars().count();
        let has_more = offset + chunk_size < total_size;

        json!({
            "requestId": request_id,
            "bodyType": body_type,
            "offset": offset,
            "chunkSize": chunk_size,
            "totalSize": total_size,
            "hasMore": has_more,
            "nextOffset": if has_more { json!(offset + chunk_size) } else { Value::Null },
            "chunk": chunk,
        })
    }

    fn search_requests(&self, input: &Value, target_id: &str) -> Value {
        let url = input["url"].as_str();
        let method = input["method"].as_str();
        let min_status = input["minStatus"].as_u64().map(|s| s as u16);
        let max_status = input["maxStatus"].as_u64().map(|s| s as u16);

        let filter = EntryFilter {
            method: method.map(str::to_string),
            min_status,
            max_status,
        };

        // URL search first (it is the narrower index), then the remaining
        // filters over its hits.
        let matches: Vec<NetworkEntry> = match url {
            Some(substring) => self
                .cache
                .search_by_url(target_id, substring)
                .into_iter()
                .filter(|e| filter.matches(e))
                .collect(),
            None => self.cache.filter(target_id, &filter),
        };

        json!({
            "found": matches.len(),
            "filters": {
                "url": url,
                "method": method,
                "minStatus": min_status,
                "maxStatus": max_status,
            },
            "requests": matches.iter().take(10).map(summarize).collect::<Vec<_>>(),
        })
    }

    fn search_request_content(&self, input: &Value, target_id: &str) -> Value {
        let Some(query) = input["query"].as_str().filter(|q| !q.is_empty()) else {
            return json!({ "error": "query is required" });
        };
        let search_in = match input.get("searchIn") {
            None => "all",
            Some(Value::String(s))
                if matches!(s.as_str(), "all" | "url" | "request_body" | "response_body") =>
            {
                s.as_str()
            }
            Some(_) => {
                return json!({
                    "error": "searchIn must be one of: all, url, request_body, response_body"
                });
            }
        };
        let limit = match bounded_usize(input, "limit", 10, 15) {
            Ok(v) => v,
            Err(e) => return e,
        };

        let needle = query.to_lowercase();
        let mut results = Vec::new();

        for entry in self.cache.entries_for_target(target_id) {
            let mut matched_in = Vec::new();
            if matches!(search_in, "all" | "url")
                && entry.request.url.to_lowercase().contains(&needle)
            {
                matched_in.push("url");
            }
            if matches!(search_in, "all" | "request_body")
                && contains_ci(entry.request.body.as_deref(), &needle)
            {
                matched_in.push("request_body");
            }
            if matches!(search_in, "all" | "response_body")
                && contains_ci(entry.response.body.as_deref(), &needle)
            {
                matched_in.push("response_body");
            }

            if !matched_in.is_empty() {
                let mut summary = summarize(&entry);
                summary["matchedIn"] = json!(matched_in);
                results.push(summary);
                if results.len() >= limit {
                    break;
                }
            }
        }

        json!({
            "query": query,
            "searchIn": search_in,
            "found": results.len(),
            "results": results,
        })
    }

    fn get_cache_statistics(&self, target_id: &str) -> Value {
        let stats = self.cache.statistics(target_id);
        json!({
            "totalRequests": stats.total_entries,
            "byMethod": stats.by_method,
            "byStatus": stats.by_status,
            "byType": stats.by_type,
            "errorCount": stats.error_count,
        })
    }

    // ── Script-queue tools ────────────────────────────────────────────────

    async fn execute_javascript(
        &self,
        input: &Value,
        target_id: &str,
        cancel: &CancelToken,
    ) -> Result<Value> {
        let Some(code) = input["code"].as_str().filter(|c| !c.is_empty()) else {
            return Ok(json!({ "error": "code is required" }));
        };

        match self.run_script(target_id, code.to_string(), cancel).await {
            Ok(result) => Ok(json!(result)),
            Err(e) => script_failure(e),
        }
    }

    async fn expose_request_data(
        &self,
        input: &Value,
        target_id: &str,
        cancel: &CancelToken,
    ) -> Result<Value> {
        let Some(ids) = input["requestIds"].as_array() else {
            return Ok(json!({ "error": "requestIds must be an array of request ids" }));
        };
        let variable_name = input["variableName"].as_str().unwrap_or("data");
        if !is_js_identifier(variable_name) {
            return Ok(json!({
                "error": format!("variableName {variable_name:?} is not a valid identifier")
            }));
        }

        let mut exposed = Vec::new();
        for id in ids.iter().filter_map(Value::as_str) {
            if let Some(entry) = self.cache.entry(target_id, id) {
                exposed.push(exposable_record(&entry));
            }
        }
        if exposed.is_empty() {
            return Ok(json!({ "error": "none of the given requestIds were found" }));
        }

        let exposed_count = exposed.len();
        let access_path = format!("window.{PAGE_NAMESPACE}.{variable_name}");
        let payload = serde_json::to_string(&Value::Array(exposed))?;
        let code = format!(
            "(() => {{ window.{PAGE_NAMESPACE} = window.{PAGE_NAMESPACE} || {{}}; \
             window.{PAGE_NAMESPACE}.{variable_name} = {payload}; \
             return 'exposed {exposed_count} request(s) at {access_path}'; }})()"
        );

        match self.run_script(target_id, code, cancel).await {
            Ok(_) => Ok(json!({
                "exposedCount": exposed_count,
                "variableName": variable_name,
                "accessPath": access_path,
            })),
            Err(e) => script_failure(e),
        }
    }

    /// Await a queued script, racing the conversation's cancel token.
    async fn run_script(
        &self,
        target_id: &str,
        code: String,
        cancel: &CancelToken,
    ) -> Result<String> {
        tokio::select! {
            result = self.scripts.enqueue(target_id, code) => result,
            _ = cancel.cancelled() => Err(Error::Cancelled),
        }
    }
}

/// Classify a tool result for loop detection: an `error` field, or failure
/// phrasing in a textual result, counts as a failed execution.
pub fn is_failure_result(result: &Value) -> bool {
    match result {
        Value::Object(map) => map.contains_key("error"),
        Value::String(s) => {
            let lower = s.to_lowercase();
            lower.contains("not found") || lower.contains("undefined")
        }
        _ => false,
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Map a script-queue failure to a structured tool result, letting
/// cancellation through as a real error.
fn script_failure(e: Error) -> Result<Value> {
    match e {
        Error::Cancelled => Err(Error::Cancelled),
        Error::Timeout => Ok(json!({ "error": "ExecutionTimeout" })),
        Error::TargetClosed(target) => Ok(json!({ "error": format!("TargetClosed: {target}") })),
        other => Ok(json!({ "error": other.to_string() })),
    }
}

/// Read an optional non-negative integer field with a default and a cap.
/// A present-but-wrong-typed value is a structured input error.
fn bounded_usize(
    input: &Value,
    field: &str,
    default: usize,
    cap: usize,
) -> std::result::Result<usize, Value> {
    match input.get(field) {
        None | Some(Value::Null) => Ok(default),
        Some(value) => match value.as_u64() {
            Some(n) => Ok((n as usize).min(cap)),
            None => Err(json!({
                "error": format!("{field} must be a non-negative integer")
            })),
        },
    }
}

/// The per-request summary shape shared by the listing and search tools.
fn summarize(entry: &NetworkEntry) -> Value {
    json!({
        "id": entry.id,
        "url": entry.request.url,
        "method": entry.request.method,
        "status": entry.response.status,
        "statusText": entry.response.status_text,
        "durationMs": entry.timing.duration_ms,
        "requestType": entry.metadata.request_type,
        "hasError": entry.metadata.has_error,
        "timestamp": entry.request.timestamp,
    })
}

fn contains_ci(haystack: Option<&str>, lowered_needle: &str) -> bool {
    haystack.is_some_and(|h| h.to_lowercase().contains(lowered_needle))
}

/// Truncate a JSON string field in place, on a character boundary.
fn truncate_body(body: &mut Value, max_chars: usize) {
    if let Value::String(s) = body {
        if s.chars().count() > max_chars {
            *s = s.chars().take(max_chars).collect();
        }
    }
}

/// The record shape published into the page: the full entry, with the
/// response body JSON-parsed when the content type suggests JSON.
fn exposable_record(entry: &NetworkEntry) -> Value {
    let mut record = serde_json::to_value(entry).unwrap_or_else(|_| json!({}));

    let looks_like_json = entry
        .response
        .content_type
        .as_deref()
        .is_some_and(|ct| ct.contains("json"));
    if looks_like_json {
        if let Some(body) = &entry.response.body {
            if let Ok(parsed) = serde_json::from_str::<Value>(body) {
                record["response"]["body"] = parsed;
            }
        }
    }
    record
}

fn is_js_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}
