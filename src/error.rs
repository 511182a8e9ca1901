//! Error types for the page-audit agent core

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the agent core.
///
/// Recoverable tool-level problems (bad input, unknown request id) are NOT
/// represented here; they travel back to the model as structured
/// `{"error": ...}` tool results so it can self-correct. This enum covers
/// everything that surfaces to the orchestrator or the consumer.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error (connect phase, before any SSE bytes arrive)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Non-2xx response from the model endpoint, with the body read out
    #[error("Model endpoint error {status}: {body}")]
    Api { status: u16, body: String },

    /// Mid-stream decode or transport failure
    #[error("Streaming error: {0}")]
    Stream(String),

    /// Tool execution error (unknown tool, handler failure)
    #[error("Tool execution error: {0}")]
    Tool(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Script execution exceeded its deadline
    #[error("Script execution timed out")]
    Timeout,

    /// Operation observed a fired cancel token
    #[error("Operation cancelled")]
    Cancelled,

    /// The browsing context a script was queued for has gone away
    #[error("Target closed: {0}")]
    TargetClosed(String),

    /// The model failed the same tool three turns in a row
    #[error("Loop detected: {0}")]
    LoopDetected(String),

    /// The agent loop exceeded its turn cap
    #[error("Turn limit of {0} exceeded")]
    TurnLimit(u32),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new API error from a status code and response body
    pub fn api(status: u16, body: impl Into<String>) -> Self {
        Error::Api {
            status,
            body: body.into(),
        }
    }

    /// Create a new stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a target-closed error
    pub fn target_closed(target_id: impl Into<String>) -> Self {
        Error::TargetClosed(target_id.into())
    }

    /// True for failures worth retrying before a stream is open:
    /// connect-level HTTP errors, 429, and 5xx responses.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => e.is_connect() || e.is_timeout(),
            Error::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_config() {
        let err = Error::config("missing api key");
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.to_string(), "Invalid configuration: missing api key");
    }

    #[test]
    fn test_error_api() {
        let err = Error::api(500, "Internal Server Error");
        assert!(matches!(err, Error::Api { status: 500, .. }));
        assert_eq!(
            err.to_string(),
            "Model endpoint error 500: Internal Server Error"
        );
    }

    #[test]
    fn test_error_stream() {
        let err = Error::stream("connection lost");
        assert!(matches!(err, Error::Stream(_)));
        assert_eq!(err.to_string(), "Streaming error: connection lost");
    }

    #[test]
    fn test_error_tool() {
        let err = Error::tool("unknown tool 'frobnicate'");
        assert!(matches!(err, Error::Tool(_)));
        assert_eq!(
            err.to_string(),
            "Tool execution error: unknown tool 'frobnicate'"
        );
    }

    #[test]
    fn test_error_timeout_and_cancelled() {
        assert_eq!(Error::Timeout.to_string(), "Script execution timed out");
        assert_eq!(Error::Cancelled.to_string(), "Operation cancelled");
    }

    #[test]
    fn test_error_target_closed() {
        let err = Error::target_closed("tab-7");
        assert_eq!(err.to_string(), "Target closed: tab-7");
    }

    #[test]
    fn test_error_turn_limit() {
        let err = Error::TurnLimit(500);
        assert_eq!(err.to_string(), "Turn limit of 500 exceeded");
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::api(429, "slow down").is_transient());
        assert!(Error::api(503, "unavailable").is_transient());
        assert!(!Error::api(401, "bad key").is_transient());
        assert!(!Error::Timeout.is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn test_result_type_alias() {
        fn _returns_result() -> Result<i32> {
            Ok(42)
        }

        fn _returns_error() -> Result<i32> {
            Err(Error::Timeout)
        }
    }
}
