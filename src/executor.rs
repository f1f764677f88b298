//! Action Executor
//!
//! Dispatches a ready action to its executor: a local entity creation
//! through the owning SchemaProvider, a side-effect handler (send a
//! message, build an event payload, generate text), or the NodeRouter
//! when the target entity lives on another node. Every failure is
//! converted to a failed ExecutionResult at this boundary; nothing
//! escapes as an error.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use async_trait::async_trait;

use crate::catalog::{ActionDefinition, SchemaProvider};
use crate::error::{ExecutorError, ExecutorResult, RoutingResult};
use crate::extract::DEFERRED_SUFFIX;
use crate::node::{split_composite, NodeRouter, RemoteOutcome, RouteRequest};
use crate::pending::PendingAction;

/// Result of executing an action, local or remote
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Chat-style line shown to the user
    pub message: String,
    /// Structured result data
    pub data: Value,
    pub error: Option<String>,
    /// Node the action actually ran on, when remote
    pub node: Option<String>,
}

impl ExecutionResult {
    pub fn failure(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: Value::Null,
            error: Some(error.into()),
            node: None,
        }
    }

    pub fn from_remote(slug: &str, outcome: RemoteOutcome) -> Self {
        let message = if outcome.success {
            format!("Done. The action ran on {}.", slug)
        } else {
            format!(
                "Node {} could not complete the action: {}",
                slug,
                outcome.error.as_deref().unwrap_or("unknown error")
            )
        };
        Self {
            success: outcome.success,
            message,
            data: outcome.data,
            error: outcome.error,
            node: Some(slug.to_string()),
        }
    }
}

/// Side-effecting collaborator an executor id can dispatch to
#[async_trait]
pub trait SideEffectHandler: Send + Sync {
    async fn handle(&self, action: &PendingAction) -> ExecutorResult<Value>;
}

/// Execution context carried from the conversation surface
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionContext<'a> {
    /// Explicit node designation on the request
    pub explicit_node: Option<&'a str>,
    /// Inbound already-forwarded marker
    pub already_forwarded: bool,
}

pub struct ActionExecutor {
    /// Entity-creation providers by entity class
    providers: HashMap<String, Arc<dyn SchemaProvider>>,
    /// Side-effect handlers by executor id
    handlers: HashMap<String, Arc<dyn SideEffectHandler>>,
    router: Arc<NodeRouter>,
}

/// Executor ids with a meaningful local fallback when a remote call
/// fails (text generation can always run locally).
const LOCAL_FALLBACK_EXECUTORS: &[&str] = &["generate_text"];

impl ActionExecutor {
    pub fn new(router: Arc<NodeRouter>) -> Self {
        Self {
            providers: HashMap::new(),
            handlers: HashMap::new(),
            router,
        }
    }

    pub fn register_provider(&mut self, provider: Arc<dyn SchemaProvider>) {
        self.providers.insert(provider.entity_class().to_string(), provider);
    }

    pub fn register_handler(&mut self, executor_id: &str, handler: Arc<dyn SideEffectHandler>) {
        self.handlers.insert(executor_id.to_string(), handler);
    }

    /// Execute a pending action against its template definition.
    pub async fn execute(
        &self,
        action: &PendingAction,
        definition: &ActionDefinition,
        context: ExecutionContext<'_>,
    ) -> ExecutionResult {
        // Precondition: filled, unless the action carries no schema at
        // all (copy/regenerate category).
        if !action.ready_to_execute && !definition.is_schema_free() {
            let err = ExecutorError::NotReady {
                missing: action.missing_fields.clone(),
            };
            return ExecutionResult::failure(
                format!("I still need: {}.", action.missing_fields.join(", ")),
                err.to_string(),
            );
        }

        let route = RouteRequest {
            explicit_node: context.explicit_node,
            entity_source_node: definition.remote_node.as_deref(),
            entity_class: definition.entity_class.as_deref(),
            collection: None,
            already_forwarded: context.already_forwarded,
        };

        if let Some(slug) = self.router.should_route_remote(&route) {
            let payload = remote_payload(action, definition);
            let remote = self
                .router
                .execute_on(&slug, &definition.executor, payload, &action.user_id)
                .await;
            return self.unwrap_remote_or_local(remote, action, definition).await;
        }

        self.execute_local(action, definition).await
    }

    /// Unwrap a remote result, falling back to local handling where the
    /// operation has one; otherwise surface the error with the node's
    /// identity.
    async fn unwrap_remote_or_local(
        &self,
        remote: RoutingResult<ExecutionResult>,
        action: &PendingAction,
        definition: &ActionDefinition,
    ) -> ExecutionResult {
        match remote {
            Ok(result) => result,
            Err(err) if LOCAL_FALLBACK_EXECUTORS.contains(&definition.executor.as_str()) => {
                warn!(node = err.node(), error = %err, "remote failed, falling back to local");
                self.execute_local(action, definition).await
            }
            Err(err) => ExecutionResult {
                success: false,
                message: format!("Node {} could not complete the action.", err.node()),
                data: Value::Null,
                error: Some(err.to_string()),
                node: Some(err.node().to_string()),
            },
        }
    }

    async fn execute_local(
        &self,
        action: &PendingAction,
        definition: &ActionDefinition,
    ) -> ExecutionResult {
        match definition.executor.as_str() {
            "create_entity" => self.create_entity(action, definition).await,
            executor_id => match self.handlers.get(executor_id) {
                Some(handler) => match handler.handle(action).await {
                    Ok(data) => ExecutionResult {
                        success: true,
                        message: format!("{} done.", action.label),
                        data,
                        error: None,
                        node: None,
                    },
                    Err(err) => {
                        warn!(executor = executor_id, error = %err, "handler failed");
                        ExecutionResult::failure(
                            "That did not work, sorry.",
                            err.to_string(),
                        )
                    }
                },
                None => {
                    let err = ExecutorError::UnknownExecutor {
                        executor: executor_id.to_string(),
                    };
                    ExecutionResult::failure("I don't know how to run that action.", err.to_string())
                }
            },
        }
    }

    async fn create_entity(
        &self,
        action: &PendingAction,
        definition: &ActionDefinition,
    ) -> ExecutionResult {
        let Some(class) = definition
            .entity_class
            .as_deref()
            .map(|c| split_composite(c).1.to_string())
        else {
            return ExecutionResult::failure(
                "This action has no target entity.",
                ExecutorError::Local {
                    message: "create_entity without entity_class".to_string(),
                }
                .to_string(),
            );
        };

        let Some(provider) = self.providers.get(&class) else {
            return ExecutionResult::failure(
                format!("I can't create {} records here.", class),
                ExecutorError::UnknownExecutor {
                    executor: format!("create_entity:{}", class),
                }
                .to_string(),
            );
        };

        let params = local_params(&action.params);
        match provider.create_from_fields(&params, &action.user_id).await {
            Ok(record) => {
                debug!(class = %class, id = %record.id, "entity created");
                let summary = summarize_attributes(&record.attributes);
                ExecutionResult {
                    success: true,
                    message: format!("Created {}{}", class, summary),
                    data: Value::Object(record.attributes),
                    error: None,
                    node: None,
                }
            }
            Err(err) => {
                warn!(class = %class, error = %err, "entity creation failed");
                ExecutionResult::failure(
                    format!("Creating the {} failed.", class),
                    err.to_string(),
                )
            }
        }
    }
}

/// The outgoing remote payload: params plus the entity class (composite
/// form; the router strips the prefix before forwarding).
fn remote_payload(action: &PendingAction, definition: &ActionDefinition) -> Value {
    let mut map = Map::new();
    map.insert("params".to_string(), Value::Object(action.params.clone()));
    if let Some(class) = &definition.entity_class {
        map.insert("entity_class".to_string(), Value::String(class.clone()));
    }
    map.insert("user_id".to_string(), Value::String(action.user_id.clone()));
    Value::Object(map)
}

/// Params for a local provider call, with deferral markers dropped.
fn local_params(params: &Map<String, Value>) -> Map<String, Value> {
    params
        .iter()
        .filter(|(key, _)| !key.ends_with(DEFERRED_SUFFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Internal attribute names never shown to the user.
fn is_internal_attribute(key: &str) -> bool {
    key == "id"
        || key == "user_id"
        || key == "owner"
        || key.ends_with("_id")
        || key.ends_with(DEFERRED_SUFFIX)
        || key.starts_with('_')
}

/// Human-readable summary of entity attributes, internals filtered.
fn summarize_attributes(attributes: &Map<String, Value>) -> String {
    let parts: Vec<String> = attributes
        .iter()
        .filter(|(key, value)| !is_internal_attribute(key) && !value.is_null())
        .map(|(key, value)| match value {
            Value::String(s) => format!("{}: {}", key, s),
            other => format!("{}: {}", key, other),
        })
        .collect();

    if parts.is_empty() {
        ".".to_string()
    } else {
        format!(" with {}.", parts.join(", "))
    }
}
