//! LLM Client
//!
//! Unified interface to the text-generation collaborator, plus the HTTP
//! implementation and a scripted mock for tests. Calls are synchronous
//! from the caller's perspective with a bounded timeout; a timeout is a
//! terminal failure for the turn, not retried here.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::LlmConfig;
use crate::error::{AiResult, AiServiceError};

/// Tool/function definition for structured output
///
/// Used with `chat_with_tool()` to force the model to return structured
/// JSON matching a schema instead of free text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name (e.g., "extract_action_parameters")
    pub name: String,
    /// Description of what the tool does
    pub description: String,
    /// JSON Schema for the tool's parameters
    pub parameters: Value,
}

/// Plain chat completion with usage accounting
#[derive(Debug, Clone)]
pub struct ChatReply {
    pub content: String,
    pub tokens_used: u32,
}

/// Result of a forced tool call
#[derive(Debug, Clone)]
pub struct ToolCallReply {
    pub tool_name: String,
    pub arguments: Value,
    pub tokens_used: u32,
}

/// Unified LLM client interface
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Call the model with system + user prompts, return raw text.
    async fn chat(&self, system_prompt: &str, user_prompt: &str) -> AiResult<ChatReply>;

    /// Call the model expecting a JSON response. Providers without a
    /// native JSON mode rely on prompt instruction.
    async fn chat_json(&self, system_prompt: &str, user_prompt: &str) -> AiResult<ChatReply>;

    /// Call the model with a tool definition, forcing structured output.
    async fn chat_with_tool(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        tool: &ToolDefinition,
    ) -> AiResult<ToolCallReply>;

    /// Model name for logging
    fn model_name(&self) -> &str;

    /// Provider name for logging
    fn provider_name(&self) -> &str;
}

/// Parse model output as JSON, tolerating markdown code fences.
///
/// Models asked for "JSON only" still wrap the payload in ```json fences
/// often enough that the caller must not depend on a clean document.
pub fn parse_lenient_json(raw: &str) -> Result<Value, serde_json::Error> {
    let trimmed = raw.trim();

    let unfenced = if trimmed.starts_with("```") {
        let inner = trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```JSON")
            .trim_start_matches("```");
        inner.trim_end_matches("```").trim()
    } else {
        trimmed
    };

    match serde_json::from_str(unfenced) {
        Ok(value) => Ok(value),
        Err(err) => {
            // Last resort: slice from the first brace to the last one,
            // which recovers payloads with prose before or after.
            let start = unfenced.find('{');
            let end = unfenced.rfind('}');
            if let (Some(start), Some(end)) = (start, end) {
                if start < end {
                    return serde_json::from_str(&unfenced[start..=end]);
                }
            }
            Err(err)
        }
    }
}

// ============================================================================
// HTTP provider (Anthropic message API)
// ============================================================================

/// HTTP client for the Anthropic message API
#[derive(Clone)]
pub struct HttpLlmClient {
    api_key: String,
    client: reqwest::Client,
    config: LlmConfig,
    base_url: String,
}

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";

impl HttpLlmClient {
    pub fn new(api_key: String, config: LlmConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            api_key,
            client,
            config,
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    /// Create from environment variables
    pub fn from_env(config: LlmConfig) -> AiResult<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| AiServiceError::Auth)?;
        Ok(Self::new(api_key, config))
    }

    /// Override the endpoint, for tests against a local stub.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    async fn call_api(&self, body: Value) -> AiResult<ApiResponse> {
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.map_status_error(status.as_u16(), &body));
        }

        response.json::<ApiResponse>().await.map_err(|e| AiServiceError::Network {
            message: format!("malformed provider response: {}", e),
        })
    }

    fn map_transport_error(&self, err: reqwest::Error) -> AiServiceError {
        if err.is_timeout() {
            AiServiceError::Timeout {
                seconds: self.config.timeout_secs,
            }
        } else {
            AiServiceError::Network {
                message: err.to_string(),
            }
        }
    }

    fn map_status_error(&self, status: u16, body: &str) -> AiServiceError {
        match status {
            401 | 403 => AiServiceError::Auth,
            404 => AiServiceError::ModelNotFound {
                model: self.config.model.clone(),
            },
            429 if body.contains("quota") || body.contains("billing") => AiServiceError::Quota,
            429 => AiServiceError::RateLimit,
            _ => AiServiceError::Network {
                message: format!("provider returned {}: {}", status, body),
            },
        }
    }

    fn request_body(&self, system_prompt: &str, user_prompt: &str) -> Value {
        serde_json::json!({
            "model": &self.config.model,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "system": system_prompt,
            "messages": [{"role": "user", "content": user_prompt}]
        })
    }
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
    name: Option<String>,
    input: Option<Value>,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

impl Usage {
    fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn chat(&self, system_prompt: &str, user_prompt: &str) -> AiResult<ChatReply> {
        let response = self.call_api(self.request_body(system_prompt, user_prompt)).await?;
        let content = response
            .content
            .iter()
            .find_map(|c| c.text.clone())
            .ok_or_else(|| AiServiceError::Network {
                message: "empty response from provider".to_string(),
            })?;
        Ok(ChatReply {
            content,
            tokens_used: response.usage.total(),
        })
    }

    async fn chat_json(&self, system_prompt: &str, user_prompt: &str) -> AiResult<ChatReply> {
        // No native JSON mode; rely on prompt instruction.
        let json_system = format!(
            "{}\n\nIMPORTANT: Respond with valid JSON only. No markdown code blocks, no explanations.",
            system_prompt
        );
        self.chat(&json_system, user_prompt).await
    }

    async fn chat_with_tool(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        tool: &ToolDefinition,
    ) -> AiResult<ToolCallReply> {
        let mut body = self.request_body(system_prompt, user_prompt);
        body["tools"] = serde_json::json!([{
            "name": tool.name,
            "description": tool.description,
            "input_schema": tool.parameters,
        }]);
        body["tool_choice"] = serde_json::json!({"type": "tool", "name": tool.name});

        let response = self.call_api(body).await?;
        let tokens_used = response.usage.total();
        let call = response
            .content
            .into_iter()
            .find(|c| c.block_type == "tool_use")
            .ok_or_else(|| AiServiceError::Network {
                message: "provider did not return a tool call".to_string(),
            })?;

        Ok(ToolCallReply {
            tool_name: call.name.unwrap_or_else(|| tool.name.clone()),
            arguments: call.input.unwrap_or(Value::Null),
            tokens_used,
        })
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn provider_name(&self) -> &str {
        "Anthropic"
    }
}

// ============================================================================
// Scripted mock for tests
// ============================================================================

/// A scripted reply the mock will produce next
#[derive(Debug, Clone)]
pub enum MockReply {
    Text(String),
    Tool(Value),
    Error(String),
}

/// Mock client that replays scripted responses and records prompts.
#[derive(Default)]
pub struct MockLlmClient {
    replies: Mutex<VecDeque<MockReply>>,
    prompts: Mutex<Vec<String>>,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_text(&self, content: impl Into<String>) {
        self.replies.lock().unwrap().push_back(MockReply::Text(content.into()));
    }

    pub fn push_tool(&self, arguments: Value) {
        self.replies.lock().unwrap().push_back(MockReply::Tool(arguments));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.replies.lock().unwrap().push_back(MockReply::Error(message.into()));
    }

    /// Prompts seen so far, newest last.
    pub fn recorded_prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn next_reply(&self, user_prompt: &str) -> AiResult<MockReply> {
        self.prompts.lock().unwrap().push(user_prompt.to_string());
        match self.replies.lock().unwrap().pop_front() {
            Some(MockReply::Error(message)) => Err(AiServiceError::Network { message }),
            Some(reply) => Ok(reply),
            None => Ok(MockReply::Text("{}".to_string())),
        }
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn chat(&self, _system_prompt: &str, user_prompt: &str) -> AiResult<ChatReply> {
        match self.next_reply(user_prompt)? {
            MockReply::Text(content) => Ok(ChatReply { content, tokens_used: 7 }),
            MockReply::Tool(arguments) => Ok(ChatReply {
                content: arguments.to_string(),
                tokens_used: 7,
            }),
            MockReply::Error(_) => unreachable!("mapped in next_reply"),
        }
    }

    async fn chat_json(&self, system_prompt: &str, user_prompt: &str) -> AiResult<ChatReply> {
        self.chat(system_prompt, user_prompt).await
    }

    async fn chat_with_tool(
        &self,
        _system_prompt: &str,
        user_prompt: &str,
        tool: &ToolDefinition,
    ) -> AiResult<ToolCallReply> {
        match self.next_reply(user_prompt)? {
            MockReply::Tool(arguments) => Ok(ToolCallReply {
                tool_name: tool.name.clone(),
                arguments,
                tokens_used: 7,
            }),
            MockReply::Text(content) => {
                let arguments = parse_lenient_json(&content).unwrap_or(Value::Null);
                Ok(ToolCallReply {
                    tool_name: tool.name.clone(),
                    arguments,
                    tokens_used: 7,
                })
            }
            MockReply::Error(_) => unreachable!("mapped in next_reply"),
        }
    }

    fn model_name(&self) -> &str {
        "mock-model"
    }

    fn provider_name(&self) -> &str {
        "Mock"
    }
}
