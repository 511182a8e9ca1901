//! # Configuration for the page-audit agent
//!
//! Two configuration surfaces, both builder-validated:
//!
//! - [`ModelConfig`]: how to reach the model endpoint (API key, base URL,
//!   model identifier, sampling settings).
//! - [`AgentConfig`]: how the orchestrator behaves (system prompt, history
//!   bound, turn cap, script-execution timeout).
//!
//! ## Environment Variables
//!
//! - `PAGE_AUDIT_API_KEY`: API key for the model endpoint
//! - `PAGE_AUDIT_BASE_URL`: override the endpoint base URL
//! - `PAGE_AUDIT_MODEL`: override the model identifier
//!
//! ## Examples
//!
//! ```rust
//! use page_audit::{AgentConfig, ModelConfig};
//!
//! let model = ModelConfig::builder()
//!     .api_key("sk-test")
//!     .model("claude-sonnet-4-20250514")
//!     .build()
//!     .unwrap();
//!
//! let agent = AgentConfig::builder()
//!     .system_prompt("You are a web security analyst.")
//!     .max_history(10)
//!     .build()
//!     .unwrap();
//! # let _ = (model, agent);
//! ```

use crate::{Error, Result};
use std::env;
use std::time::Duration;

/// Default model endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Default model identifier.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Default bound on retained history messages.
pub const DEFAULT_MAX_HISTORY: usize = 10;

/// Default hard cap on agent-loop iterations per conversation.
pub const DEFAULT_MAX_TURNS: u32 = 500;

/// Default deadline for a queued page-script execution.
pub const DEFAULT_SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolve the model-endpoint base URL.
///
/// Explicit argument wins, then `PAGE_AUDIT_BASE_URL`, then the default.
pub fn get_base_url(explicit: Option<&str>) -> String {
    if let Some(url) = explicit {
        return url.to_string();
    }
    env::var("PAGE_AUDIT_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

/// Resolve the model identifier.
///
/// Explicit argument wins, then `PAGE_AUDIT_MODEL`, then the default.
pub fn get_model(explicit: Option<&str>) -> String {
    if let Some(model) = explicit {
        return model.to_string();
    }
    env::var("PAGE_AUDIT_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string())
}

/// Resolve the API key from `PAGE_AUDIT_API_KEY`.
pub fn get_api_key() -> Option<String> {
    env::var("PAGE_AUDIT_API_KEY").ok().filter(|k| !k.is_empty())
}

// ============================================================================
// MODEL CONFIG
// ============================================================================

/// Connection settings for the model endpoint.
///
/// Sampling settings (`max_tokens`, `temperature`) live in [`AgentConfig`]
/// since they describe how the orchestrator drives a turn, not how to reach
/// the endpoint.
#[derive(Clone)]
pub struct ModelConfig {
    api_key: String,
    base_url: String,
    model: String,
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The key never goes to logs.
        f.debug_struct("ModelConfig")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

impl ModelConfig {
    pub fn builder() -> ModelConfigBuilder {
        ModelConfigBuilder::default()
    }

    /// Build from environment variables alone.
    pub fn from_env() -> Result<Self> {
        let mut builder = Self::builder();
        if let Some(key) = get_api_key() {
            builder = builder.api_key(key);
        }
        builder.build()
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Builder for [`ModelConfig`] with validation at `build()`.
#[derive(Default)]
pub struct ModelConfigBuilder {
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
}

impl ModelConfigBuilder {
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Validate and construct.
    ///
    /// # Errors
    ///
    /// - missing or blank API key
    /// - base URL without an `http://` / `https://` scheme
    /// - blank model name
    pub fn build(self) -> Result<ModelConfig> {
        let api_key = self
            .api_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| Error::config("api_key is required (or set PAGE_AUDIT_API_KEY)"))?;

        let base_url = get_base_url(self.base_url.as_deref());
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(Error::config(
                "base_url must start with http:// or https://",
            ));
        }

        let model = get_model(self.model.as_deref());
        if model.trim().is_empty() {
            return Err(Error::config("model cannot be empty"));
        }

        Ok(ModelConfig {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }
}

// ============================================================================
// AGENT CONFIG
// ============================================================================

/// Orchestrator behavior settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    system_prompt: String,
    max_history: usize,
    max_turns: u32,
    max_tokens: u32,
    temperature: f32,
    script_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: String::new(),
            max_history: DEFAULT_MAX_HISTORY,
            max_turns: DEFAULT_MAX_TURNS,
            max_tokens: 4096,
            temperature: 0.2,
            script_timeout: DEFAULT_SCRIPT_TIMEOUT,
        }
    }
}

impl AgentConfig {
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    pub fn system_prompt(&self) -> &str {
        &self.system_prompt
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    pub fn max_turns(&self) -> u32 {
        self.max_turns
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn script_timeout(&self) -> Duration {
        self.script_timeout
    }
}

/// Builder for [`AgentConfig`].
#[derive(Debug, Default)]
pub struct AgentConfigBuilder {
    system_prompt: Option<String>,
    max_history: Option<usize>,
    max_turns: Option<u32>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    script_timeout: Option<Duration>,
}

impl AgentConfigBuilder {
    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn max_history(mut self, max_history: usize) -> Self {
        self.max_history = Some(max_history);
        self
    }

    pub fn max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = Some(max_turns);
        self
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn script_timeout(mut self, timeout: Duration) -> Self {
        self.script_timeout = Some(timeout);
        self
    }

    /// Validate and construct.
    ///
    /// # Errors
    ///
    /// `max_history` and `max_turns` must both be at least 1 (a zero-length
    /// history could never hold the user prompt, a zero-turn loop could
    /// never call the model), and temperature must lie in `0.0..=1.0`.
    pub fn build(self) -> Result<AgentConfig> {
        let max_history = self.max_history.unwrap_or(DEFAULT_MAX_HISTORY);
        if max_history == 0 {
            return Err(Error::config("max_history must be at least 1"));
        }

        let max_turns = self.max_turns.unwrap_or(DEFAULT_MAX_TURNS);
        if max_turns == 0 {
            return Err(Error::config("max_turns must be at least 1"));
        }

        let temperature = self.temperature.unwrap_or(0.2);
        if !(0.0..=1.0).contains(&temperature) {
            return Err(Error::config("temperature must be between 0.0 and 1.0"));
        }

        Ok(AgentConfig {
            system_prompt: self.system_prompt.unwrap_or_default(),
            max_history,
            max_turns,
            max_tokens: self.max_tokens.unwrap_or(4096),
            temperature,
            script_timeout: self.script_timeout.unwrap_or(DEFAULT_SCRIPT_TIMEOUT),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_config_requires_api_key() {
        let err = ModelConfig::builder().build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_model_config_rejects_blank_api_key() {
        let err = ModelConfig::builder().api_key("   ").build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_model_config_rejects_schemeless_base_url() {
        let err = ModelConfig::builder()
            .api_key("sk-test")
            .base_url("api.example.com")
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_model_config_trims_trailing_slash() {
        let config = ModelConfig::builder()
            .api_key("sk-test")
            .base_url("https://proxy.example.com/")
            .build()
            .unwrap();
        assert_eq!(config.base_url(), "https://proxy.example.com");
    }

    #[test]
    fn test_model_config_defaults() {
        let config = ModelConfig::builder().api_key("sk-test").build().unwrap();
        assert!(!config.model().is_empty());
        assert!(config.base_url().starts_with("https://"));
    }

    #[test]
    fn test_agent_config_rejects_out_of_range_temperature() {
        let err = AgentConfig::builder()
            .temperature(1.5)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_model_config_debug_redacts_key() {
        let config = ModelConfig::builder()
            .api_key("sk-supersecret")
            .build()
            .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("supersecret"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_agent_config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.max_history(), DEFAULT_MAX_HISTORY);
        assert_eq!(config.max_turns(), DEFAULT_MAX_TURNS);
        assert_eq!(config.max_tokens(), 4096);
        assert!((config.temperature() - 0.2).abs() < f32::EPSILON);
        assert_eq!(config.script_timeout(), DEFAULT_SCRIPT_TIMEOUT);
    }

    #[test]
    fn test_agent_config_rejects_zero_bounds() {
        assert!(AgentConfig::builder().max_history(0).build().is_err());
        assert!(AgentConfig::builder().max_turns(0).build().is_err());
    }

    #[test]
    fn test_agent_config_builder_overrides() {
        let config = AgentConfig::builder()
            .system_prompt("analyst")
            .max_history(4)
            .max_turns(12)
            .script_timeout(Duration::from_millis(250))
            .build()
            .unwrap();
        assert_eq!(config.system_prompt(), "analyst");
        assert_eq!(config.max_history(), 4);
        assert_eq!(config.max_turns(), 12);
        assert_eq!(config.script_timeout(), Duration::from_millis(250));
    }
}
