//! Engine configuration
//!
//! Serde-deserializable configuration with sensible defaults and
//! environment-variable overrides. TTLs and timeouts are configuration,
//! not constants; the defaults documented here (pending action 24h,
//! session pin 1h) can be overridden per deployment.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default model used when no override is configured
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Text-generation provider settings
    pub llm: LlmConfig,
    /// Lifetime of a pending action before an abandoned session is reaped
    pub pending_ttl_secs: u64,
    /// Lifetime of a session-to-node pin
    pub pin_ttl_secs: u64,
    /// Timeout for peer-node HTTP calls
    pub node_timeout_secs: u64,
    /// Timeout for relationship-search calls
    pub search_timeout_secs: u64,
    /// Minimum classification confidence for intent-matched templates
    pub intent_match_threshold: f64,
    /// User-facing messages keyed by AI failure kind
    pub error_messages: HashMap<String, String>,
}

/// Text-generation provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: 1024,
            temperature: 0.2,
            timeout_secs: 30,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            pending_ttl_secs: 24 * 60 * 60,
            pin_ttl_secs: 60 * 60,
            node_timeout_secs: 15,
            search_timeout_secs: 5,
            intent_match_threshold: 0.8,
            error_messages: default_error_messages(),
        }
    }
}

impl EngineConfig {
    /// Build a configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(model) = std::env::var("ACTIONFLOW_MODEL") {
            config.llm.model = model;
        }
        if let Some(secs) = env_u64("ACTIONFLOW_PENDING_TTL_SECS") {
            config.pending_ttl_secs = secs;
        }
        if let Some(secs) = env_u64("ACTIONFLOW_PIN_TTL_SECS") {
            config.pin_ttl_secs = secs;
        }
        if let Some(secs) = env_u64("ACTIONFLOW_NODE_TIMEOUT_SECS") {
            config.node_timeout_secs = secs;
        }
        if let Some(secs) = env_u64("ACTIONFLOW_LLM_TIMEOUT_SECS") {
            config.llm.timeout_secs = secs;
        }

        config
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn pin_ttl(&self) -> Duration {
        Duration::from_secs(self.pin_ttl_secs)
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn default_error_messages() -> HashMap<String, String> {
    let entries = [
        ("quota", "The assistant has reached its usage limit for now."),
        ("rate_limit", "Too many requests at once. Give it a moment and try again."),
        ("auth", "The assistant could not authenticate with its language service."),
        ("timeout", "The language service took too long to respond. Please try again."),
        ("model_not_found", "The configured language model is unavailable."),
        ("network", "The assistant could not reach its language service."),
    ];
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
