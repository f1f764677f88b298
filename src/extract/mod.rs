//! Parameter Extractor
//!
//! Fills an action's field schema from the message and recent turns.
//! Preferred strategy is a forced tool call against a schema derived
//! from the field specs, which guarantees type-correct output. When the
//! provider rejects that, a free-text JSON prompt is tried; if the
//! provider is down entirely, a deterministic regex pass still rescues
//! numeric fields so the turn degrades instead of failing.

pub mod resolve;
pub mod satisfy;

use std::sync::Arc;

use regex::Regex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::catalog::{FieldSpec, FieldType};
use crate::error::ExtractionError;
use crate::llm::{parse_lenient_json, LlmClient, ToolDefinition};

pub use resolve::{RelationshipResolver, DEFERRED_SUFFIX};
pub use satisfy::{is_satisfied, missing_required};

pub struct ParameterExtractor {
    llm: Arc<dyn LlmClient>,
    resolver: RelationshipResolver,
}

impl ParameterExtractor {
    pub fn new(llm: Arc<dyn LlmClient>, resolver: RelationshipResolver) -> Self {
        Self { llm, resolver }
    }

    /// Extract parameters for `schema` from the message, resolving
    /// relationship fields before returning. Never fails the turn.
    pub async fn extract(
        &self,
        message: &str,
        recent_turns: &[String],
        schema: &[FieldSpec],
        user_id: &str,
    ) -> Map<String, Value> {
        if schema.is_empty() {
            return Map::new();
        }

        let mut params = match self.extract_structured(message, recent_turns, schema).await {
            Some(params) => params,
            None => match self.extract_freeform(message, recent_turns, schema).await {
                Some(params) => params,
                None => {
                    warn!("both extraction strategies failed, falling back to numeric regex");
                    extract_numeric_fallback(message, schema)
                }
            },
        };

        retain_schema_keys(&mut params, schema);
        self.resolver.resolve(schema, &mut params, user_id).await;
        params
    }

    /// Resolve relationship fields in params that were extracted
    /// elsewhere (e.g., by the intent classifier).
    pub async fn resolve_relationships(
        &self,
        schema: &[FieldSpec],
        params: &mut Map<String, Value>,
        user_id: &str,
    ) {
        self.resolver.resolve(schema, params, user_id).await;
    }

    /// Strategy A: forced tool call with a schema derived from the
    /// field specs.
    async fn extract_structured(
        &self,
        message: &str,
        recent_turns: &[String],
        schema: &[FieldSpec],
    ) -> Option<Map<String, Value>> {
        let tool = ToolDefinition {
            name: "extract_action_parameters".to_string(),
            description: "Record the parameter values present in the user's message".to_string(),
            parameters: json_schema_for(schema),
        };

        let reply = self
            .llm
            .chat_with_tool(
                "Extract only values the user actually stated. Omit fields they did not mention.",
                &prompt_with_context(message, recent_turns),
                &tool,
            )
            .await;

        match reply {
            Ok(call) => match call.arguments {
                Value::Object(map) => Some(map),
                _ => None,
            },
            Err(err) => {
                debug!(error = %err, "structured extraction unavailable");
                None
            }
        }
    }

    /// Strategy B: free-text JSON prompt.
    async fn extract_freeform(
        &self,
        message: &str,
        recent_turns: &[String],
        schema: &[FieldSpec],
    ) -> Option<Map<String, Value>> {
        let field_list: Vec<String> = schema
            .iter()
            .map(|f| format!("- {} ({}): {}", f.name, type_name(f.field_type), f.description))
            .collect();
        let system = format!(
            "Extract the following fields from the user's message as a JSON object. \
             Omit fields that are not mentioned.\nFields:\n{}",
            field_list.join("\n")
        );

        let reply = self
            .llm
            .chat_json(&system, &prompt_with_context(message, recent_turns))
            .await
            .ok()?;

        match parse_lenient_json(&reply.content) {
            Ok(Value::Object(map)) => Some(map),
            Ok(_) => None,
            Err(err) => {
                let err = ExtractionError::Parse {
                    message: err.to_string(),
                };
                warn!(error = %err, "freeform extraction returned malformed JSON");
                None
            }
        }
    }
}

fn prompt_with_context(message: &str, recent_turns: &[String]) -> String {
    if recent_turns.is_empty() {
        return message.to_string();
    }
    format!(
        "Recent conversation:\n{}\n\nCurrent message: {}",
        recent_turns.join("\n"),
        message
    )
}

fn type_name(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Text => "text",
        FieldType::Number => "number",
        FieldType::Boolean => "boolean",
        FieldType::Date => "date",
        FieldType::Array => "array",
        FieldType::Object => "object",
    }
}

fn json_type(field_type: FieldType) -> &'static str {
    match field_type {
        FieldType::Text | FieldType::Date => "string",
        FieldType::Number => "number",
        FieldType::Boolean => "boolean",
        FieldType::Array => "array",
        FieldType::Object => "object",
    }
}

/// JSON Schema for the forced tool call.
fn json_schema_for(schema: &[FieldSpec]) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    for field in schema {
        let mut prop = Map::new();
        prop.insert("type".to_string(), Value::String(json_type(field.field_type).to_string()));
        if !field.description.is_empty() {
            prop.insert("description".to_string(), Value::String(field.description.clone()));
        }
        if field.field_type == FieldType::Array && !field.item_schema.is_empty() {
            prop.insert("items".to_string(), json_schema_for(&field.item_schema));
        }
        properties.insert(field.name.clone(), Value::Object(prop));

        if field.required {
            required.push(Value::String(field.name.clone()));
        }
    }

    let mut out = Map::new();
    out.insert("type".to_string(), Value::String("object".to_string()));
    out.insert("properties".to_string(), Value::Object(properties));
    out.insert("required".to_string(), Value::Array(required));
    Value::Object(out)
}

/// Drop keys that relate to nothing in the schema: not a field name, an
/// alternative, a relationship prefix, or a numbered flat form.
fn retain_schema_keys(params: &mut Map<String, Value>, schema: &[FieldSpec]) {
    params.retain(|key, _| {
        schema.iter().any(|field| {
            if key == &field.name || field.alternatives.iter().any(|a| a == key) {
                return true;
            }
            if key.starts_with(&format!("{}_", field.name)) {
                return true;
            }
            if field.field_type == FieldType::Array {
                if let Some(stem) = field.name.strip_suffix('s') {
                    if key.starts_with(&format!("{}_", stem)) {
                        return true;
                    }
                }
                // Flat top-level item fields.
                if field.item_schema.iter().any(|sub| sub.name == *key) {
                    return true;
                }
            }
            false
        })
    });
}

/// Deterministic last resort: pull labeled numbers out of the message
/// for numeric fields. `total is 42` / `total: 42` / `total = 42`.
fn extract_numeric_fallback(message: &str, schema: &[FieldSpec]) -> Map<String, Value> {
    let mut params = Map::new();

    for field in schema {
        if field.field_type != FieldType::Number {
            continue;
        }
        let pattern = format!(
            r"(?i)\b{}\b\s*(?:is|=|:)?\s*(-?\d+(?:\.\d+)?)",
            regex::escape(&field.name)
        );
        let Ok(re) = Regex::new(&pattern) else {
            continue;
        };
        if let Some(caps) = re.captures(message) {
            if let Some(value) = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok()) {
                let number = serde_json::Number::from_f64(value)
                    .map(Value::Number)
                    .unwrap_or(Value::Null);
                params.insert(field.name.clone(), number);
            }
        }
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::MemoryEntityStore;
    use crate::llm::MockLlmClient;
    use serde_json::json;

    fn schema() -> Vec<FieldSpec> {
        vec![
            FieldSpec::required_text("title", "Event title"),
            FieldSpec {
                name: "headcount".to_string(),
                field_type: FieldType::Number,
                required: false,
                description: "Expected attendance".to_string(),
                relationship: None,
                alternatives: Vec::new(),
                item_schema: Vec::new(),
            },
        ]
    }

    fn extractor(mock: Arc<MockLlmClient>) -> ParameterExtractor {
        let store = MemoryEntityStore::shared();
        ParameterExtractor::new(mock, RelationshipResolver::new(store.clone(), store))
    }

    #[tokio::test]
    async fn test_structured_extraction_preferred() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_tool(json!({"title": "Board review", "headcount": 9}));

        let params = extractor(mock)
            .extract("schedule the board review for nine people", &[], &schema(), "u1")
            .await;

        assert_eq!(params["title"], "Board review");
        assert_eq!(params["headcount"], 9);
    }

    #[tokio::test]
    async fn test_freeform_fallback_on_tool_failure() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error("tool use unsupported");
        mock.push_text("```json\n{\"title\": \"Board review\"}\n```");

        let params = extractor(mock)
            .extract("schedule the board review", &[], &schema(), "u1")
            .await;

        assert_eq!(params["title"], "Board review");
    }

    #[tokio::test]
    async fn test_numeric_regex_last_resort() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_error("provider down");
        mock.push_error("provider still down");

        let params = extractor(mock)
            .extract("headcount is 12", &[], &schema(), "u1")
            .await;

        assert_eq!(params["headcount"], json!(12.0));
    }

    #[tokio::test]
    async fn test_unrelated_keys_are_dropped() {
        let mock = Arc::new(MockLlmClient::new());
        mock.push_tool(json!({"title": "Sync", "color": "blue"}));

        let params = extractor(mock)
            .extract("schedule a sync", &[], &schema(), "u1")
            .await;

        assert!(params.contains_key("title"));
        assert!(!params.contains_key("color"));
    }

    #[tokio::test]
    async fn test_empty_schema_short_circuits() {
        let mock = Arc::new(MockLlmClient::new());
        let params = extractor(mock.clone()).extract("whatever", &[], &[], "u1").await;
        assert!(params.is_empty());
        assert!(mock.recorded_prompts().is_empty());
    }

    #[test]
    fn test_json_schema_shape() {
        let value = json_schema_for(&schema());
        assert_eq!(value["type"], "object");
        assert_eq!(value["properties"]["headcount"]["type"], "number");
        assert_eq!(value["required"], json!(["title"]));
    }
}
