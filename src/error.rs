//! Error handling for the action-fulfillment engine
//!
//! This module provides idiomatic Rust error types using thiserror for
//! better error messages and proper error chain handling. Every failure
//! is caught at the boundary nearest its origin and converted into a
//! typed, recoverable result; nothing aborts a conversational turn.

use std::collections::HashMap;

use thiserror::Error;

/// Top-level error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("AI service error: {0}")]
    AiService(#[from] AiServiceError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures from the text-generation collaborator
#[derive(Error, Debug)]
pub enum AiServiceError {
    #[error("Quota exhausted for the current billing period")]
    Quota,

    #[error("Rate limit exceeded, retry later")]
    RateLimit,

    #[error("Authentication with the AI provider failed")]
    Auth,

    #[error("AI provider call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Model '{model}' not found")]
    ModelNotFound { model: String },

    #[error("Network error reaching the AI provider: {message}")]
    Network { message: String },
}

impl AiServiceError {
    /// Stable key into the configurable user-facing message table.
    pub fn message_key(&self) -> &'static str {
        match self {
            AiServiceError::Quota => "quota",
            AiServiceError::RateLimit => "rate_limit",
            AiServiceError::Auth => "auth",
            AiServiceError::Timeout { .. } => "timeout",
            AiServiceError::ModelNotFound { .. } => "model_not_found",
            AiServiceError::Network { .. } => "network",
        }
    }

    /// Map to a chat-style message, falling back to a generic line when
    /// the table has no entry for this failure.
    pub fn user_message(&self, table: &HashMap<String, String>) -> String {
        table
            .get(self.message_key())
            .cloned()
            .unwrap_or_else(|| "The assistant is temporarily unavailable. Please try again.".to_string())
    }
}

/// Failures while extracting parameters from collaborator output
#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Malformed JSON from the AI provider: {message}")]
    Parse { message: String },

    #[error("Extracted field '{field}' does not belong to the outstanding field set")]
    HallucinatedField { field: String },

    #[error("Required field '{field}' is missing")]
    MissingRequiredField { field: String },
}

/// Failures while routing to or executing on a federated node
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("Node '{node}' is not registered")]
    UnknownNode { node: String },

    #[error("Remote execution on node '{node}' failed: {message}")]
    Remote { node: String, message: String },

    #[error("Remote response from node '{node}' had an unexpected shape")]
    Envelope { node: String },

    #[error("Call to node '{node}' timed out after {seconds}s")]
    Timeout { node: String, seconds: u64 },

    #[error("Network error reaching node '{node}': {message}")]
    Network { node: String, message: String },
}

impl RoutingError {
    /// The node the failure originated on, for user-visible surfacing.
    pub fn node(&self) -> &str {
        match self {
            RoutingError::UnknownNode { node }
            | RoutingError::Remote { node, .. }
            | RoutingError::Envelope { node }
            | RoutingError::Timeout { node, .. }
            | RoutingError::Network { node, .. } => node,
        }
    }
}

/// Failures inside a local executor
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("No executor registered for id '{executor}'")]
    UnknownExecutor { executor: String },

    #[error("Action is not ready to execute; missing fields: {missing:?}")]
    NotReady { missing: Vec<String> },

    #[error("Local execution failed: {message}")]
    Local { message: String },
}

/// Failures in the session or entity stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Stored value for '{key}' could not be decoded: {message}")]
    Decode { key: String, message: String },

    #[error("Entity '{class}' with id '{id}' not found")]
    EntityNotFound { class: String, id: String },

    #[error("Entity operation on '{class}' failed: {message}")]
    Entity { class: String, message: String },
}

/// Result type aliases for convenience
pub type EngineResult<T> = Result<T, EngineError>;
pub type AiResult<T> = Result<T, AiServiceError>;
pub type RoutingResult<T> = Result<T, RoutingError>;
pub type ExecutorResult<T> = Result<T, ExecutorError>;
pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_conversion() {
        let ai = AiServiceError::RateLimit;
        let engine: EngineError = ai.into();
        assert!(matches!(engine, EngineError::AiService(_)));
    }

    #[test]
    fn test_user_message_table() {
        let mut table = HashMap::new();
        table.insert("rate_limit".to_string(), "Slow down a little.".to_string());

        let msg = AiServiceError::RateLimit.user_message(&table);
        assert_eq!(msg, "Slow down a little.");

        let fallback = AiServiceError::Auth.user_message(&table);
        assert!(fallback.contains("temporarily unavailable"));
    }

    #[test]
    fn test_routing_error_node() {
        let err = RoutingError::Timeout {
            node: "node-b".to_string(),
            seconds: 15,
        };
        assert_eq!(err.node(), "node-b");
    }

    #[test]
    fn test_extraction_error_display() {
        let parse = ExtractionError::Parse {
            message: "unexpected token".to_string(),
        };
        assert!(parse.to_string().contains("unexpected token"));

        let missing = ExtractionError::MissingRequiredField {
            field: "customer".to_string(),
        };
        assert!(missing.to_string().contains("customer"));

        let hallucinated = ExtractionError::HallucinatedField {
            field: "color".to_string(),
        };
        assert!(hallucinated.to_string().contains("color"));
    }
}
