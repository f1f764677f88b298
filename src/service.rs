//! Conversation Service
//!
//! The exposed surface of the engine: one call per conversational turn.
//! Classifies the message relative to any pending action, then drives
//! the state machine: match a new action, merge provided data, execute
//! on confirm, cancel on reject. A turn never fails with an error; the
//! worst outcome is a degraded chat-style message.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Map;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::catalog::{discovery, ActionCatalog, ActionDefinition, SchemaProvider};
use crate::config::EngineConfig;
use crate::entity::{EntitySearch, EntityStore};
use crate::error::AiServiceError;
use crate::executor::{ActionExecutor, ExecutionContext, ExecutionResult, SideEffectHandler};
use crate::extract::{ParameterExtractor, RelationshipResolver};
use crate::intent::{Intent, IntentAnalysis, IntentClassifier};
use crate::kv::KvStore;
use crate::llm::LlmClient;
use crate::node::{NodeClient, NodeDescriptor, NodeRouter};
use crate::pending::{PendingAction, PendingActionStore};

/// Per-turn options from the caller
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Explicit node designation for this turn
    pub explicit_node: Option<String>,
    /// Inbound already-forwarded marker from a peer node
    pub already_forwarded: bool,
    /// Recent conversation turns, supplied by the history collaborator
    pub recent_turns: Vec<String>,
}

/// Snapshot of the active workflow for response metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub action_id: String,
    pub label: String,
    pub missing_fields: Vec<String>,
    pub ready_to_execute: bool,
}

impl From<&PendingAction> for WorkflowSnapshot {
    fn from(action: &PendingAction) -> Self {
        Self {
            action_id: action.action_id.clone(),
            label: action.label.clone(),
            missing_fields: action.missing_fields.clone(),
            ready_to_execute: action.ready_to_execute,
        }
    }
}

/// Metadata attached to every turn response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnMetadata {
    pub intent: Option<IntentAnalysis>,
    pub active_workflow: Option<WorkflowSnapshot>,
    pub executed: Option<ExecutionResult>,
}

/// The response to one conversational turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResponse {
    pub content: String,
    pub metadata: TurnMetadata,
    pub success: bool,
}

impl TurnResponse {
    fn chat(content: impl Into<String>, metadata: TurnMetadata) -> Self {
        Self {
            content: content.into(),
            metadata,
            success: true,
        }
    }
}

/// The conversational action-fulfillment engine
pub struct ConversationService {
    config: EngineConfig,
    llm: Arc<dyn LlmClient>,
    classifier: IntentClassifier,
    catalog: RwLock<ActionCatalog>,
    extractor: ParameterExtractor,
    pending: PendingActionStore,
    executor: ActionExecutor,
    router: Arc<NodeRouter>,
    providers: Vec<Arc<dyn SchemaProvider>>,
    node_client: Arc<dyn NodeClient>,
}

/// Assembles a ConversationService from its collaborators.
pub struct ConversationServiceBuilder {
    config: EngineConfig,
    llm: Option<Arc<dyn LlmClient>>,
    kv: Option<Arc<dyn KvStore>>,
    entity_store: Option<Arc<dyn EntityStore>>,
    entity_search: Option<Arc<dyn EntitySearch>>,
    node_client: Option<Arc<dyn NodeClient>>,
    nodes: Vec<NodeDescriptor>,
    ownership: HashMap<String, String>,
    providers: Vec<Arc<dyn SchemaProvider>>,
    handlers: Vec<(String, Arc<dyn SideEffectHandler>)>,
}

impl ConversationServiceBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            llm: None,
            kv: None,
            entity_store: None,
            entity_search: None,
            node_client: None,
            nodes: Vec::new(),
            ownership: HashMap::new(),
            providers: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn entity_store(mut self, store: Arc<dyn EntityStore>) -> Self {
        self.entity_store = Some(store);
        self
    }

    pub fn entity_search(mut self, search: Arc<dyn EntitySearch>) -> Self {
        self.entity_search = Some(search);
        self
    }

    pub fn node_client(mut self, client: Arc<dyn NodeClient>) -> Self {
        self.node_client = Some(client);
        self
    }

    pub fn node(mut self, descriptor: NodeDescriptor) -> Self {
        self.nodes.push(descriptor);
        self
    }

    pub fn ownership(mut self, collection: &str, node: &str) -> Self {
        self.ownership.insert(collection.to_string(), node.to_string());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn SchemaProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn handler(mut self, executor_id: &str, handler: Arc<dyn SideEffectHandler>) -> Self {
        self.handlers.push((executor_id.to_string(), handler));
        self
    }

    /// Wire everything together. Missing collaborators are a builder
    /// misuse, reported as an error rather than a panic.
    pub fn build(self) -> anyhow::Result<ConversationService> {
        let llm = self.llm.ok_or_else(|| anyhow::anyhow!("llm client is required"))?;
        let kv = self.kv.ok_or_else(|| anyhow::anyhow!("kv store is required"))?;
        let entity_store = self
            .entity_store
            .ok_or_else(|| anyhow::anyhow!("entity store is required"))?;
        let entity_search = self
            .entity_search
            .ok_or_else(|| anyhow::anyhow!("entity search is required"))?;
        let node_client = self
            .node_client
            .ok_or_else(|| anyhow::anyhow!("node client is required"))?;

        let router = Arc::new(NodeRouter::new(
            self.nodes,
            self.ownership,
            node_client.clone(),
            kv.clone(),
            self.config.pin_ttl(),
        ));

        let mut executor = ActionExecutor::new(router.clone());
        for provider in &self.providers {
            executor.register_provider(provider.clone());
        }
        for (executor_id, handler) in &self.handlers {
            executor.register_handler(executor_id, handler.clone());
        }

        let resolver = RelationshipResolver::new(entity_search, entity_store);

        Ok(ConversationService {
            classifier: IntentClassifier::new(llm.clone()),
            catalog: RwLock::new(ActionCatalog::new(self.config.intent_match_threshold)),
            extractor: ParameterExtractor::new(llm.clone(), resolver),
            pending: PendingActionStore::new(kv, self.config.pending_ttl()),
            executor,
            router,
            providers: self.providers,
            node_client,
            llm,
            config: self.config,
        })
    }
}

impl ConversationService {
    pub fn builder(config: EngineConfig) -> ConversationServiceBuilder {
        ConversationServiceBuilder::new(config)
    }

    pub fn router(&self) -> Arc<NodeRouter> {
        self.router.clone()
    }

    /// Re-derive the dynamic action set from local providers and
    /// federated nodes. Safe to re-run per request.
    pub async fn refresh_catalog(&self) {
        let discovered = discovery::discover(
            &self.providers,
            &self.router.descriptors(),
            self.node_client.as_ref(),
        )
        .await;
        self.catalog.write().await.set_discovered(discovered);
    }

    /// Process one conversational turn.
    pub async fn process(
        &self,
        message: &str,
        session_id: &str,
        user_id: &str,
        options: ProcessOptions,
    ) -> TurnResponse {
        let pending = match self.pending.get(session_id).await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(session = session_id, error = %err, "pending action unreadable, discarding");
                self.pending.delete(session_id).await;
                None
            }
        };

        let candidates = self.catalog.read().await.candidate_summaries();
        let analysis = self
            .classifier
            .classify(message, pending.as_ref(), &candidates)
            .await;
        info!(intent = ?analysis.intent, confidence = analysis.confidence, "turn classified");

        let metadata = TurnMetadata {
            intent: Some(analysis.clone()),
            active_workflow: pending.as_ref().map(WorkflowSnapshot::from),
            executed: None,
        };

        match analysis.intent {
            Intent::Confirm => {
                self.handle_confirm(session_id, pending, &options, metadata)
                    .await
            }
            Intent::Reject => self.handle_reject(session_id, pending, metadata).await,
            Intent::Greeting => {
                let content = match &pending {
                    Some(action) => format!(
                        "Hello! We were in the middle of \"{}\". Say yes to run it or no to drop it.",
                        action.label
                    ),
                    None => "Hello! What would you like to do?".to_string(),
                };
                TurnResponse::chat(content, metadata)
            }
            Intent::ProvideData | Intent::Modify | Intent::UseSuggestions => {
                match pending {
                    Some(action) => {
                        self.handle_merge(message, session_id, user_id, action, &analysis, &options, metadata)
                            .await
                    }
                    // Data with nothing to attach it to: treat as a new
                    // request so a matching template can pick it up.
                    None => {
                        self.handle_new_request(message, session_id, user_id, &analysis, &options, metadata)
                            .await
                    }
                }
            }
            Intent::NewRequest | Intent::NewWorkflow | Intent::ComplexTask => {
                self.handle_new_request(message, session_id, user_id, &analysis, &options, metadata)
                    .await
            }
            Intent::Question | Intent::Retrieval => {
                let content = self.chat_reply(message, &analysis).await;
                TurnResponse::chat(content, metadata)
            }
        }
    }

    async fn handle_confirm(
        &self,
        session_id: &str,
        pending: Option<PendingAction>,
        options: &ProcessOptions,
        mut metadata: TurnMetadata,
    ) -> TurnResponse {
        let Some(action) = pending else {
            return TurnResponse::chat("There's nothing waiting for a confirmation right now.", metadata);
        };

        if !action.ready_to_execute {
            // Never execute an unfilled action; ask for what's missing.
            return TurnResponse::chat(
                format!(
                    "Not quite ready. I still need: {}.",
                    action.missing_fields.join(", ")
                ),
                metadata,
            );
        }

        let catalog = self.catalog.read().await;
        let Some(definition) = catalog.get(&action.action_id).cloned() else {
            drop(catalog);
            warn!(action = %action.action_id, "pending action references an unknown template");
            self.pending.delete(session_id).await;
            return TurnResponse::chat(
                "That action is no longer available; I've dropped it.",
                metadata,
            );
        };
        drop(catalog);

        // A session pinned mid-workflow keeps executing on its node
        // unless the request designates one explicitly.
        let pinned = self.router.pinned_node(session_id).await;
        let context = ExecutionContext {
            explicit_node: options.explicit_node.as_deref().or(pinned.as_deref()),
            already_forwarded: options.already_forwarded,
        };
        let result = self.executor.execute(&action, &definition, context).await;

        if result.success {
            if let Err(err) = self.pending.mark_executed(session_id).await {
                warn!(session = session_id, error = %err, "could not flag action executed");
            }
            self.pending.delete(session_id).await;
            self.router.clear_pin(session_id).await;
            metadata.active_workflow = None;
        }

        let content = result.message.clone();
        let success = result.success;
        metadata.executed = Some(result);
        TurnResponse {
            content,
            metadata,
            success,
        }
    }

    async fn handle_reject(
        &self,
        session_id: &str,
        pending: Option<PendingAction>,
        mut metadata: TurnMetadata,
    ) -> TurnResponse {
        match pending {
            Some(action) => {
                self.pending.delete(session_id).await;
                self.router.clear_pin(session_id).await;
                metadata.active_workflow = None;
                TurnResponse::chat(
                    format!("Okay, I've dropped \"{}\".", action.label),
                    metadata,
                )
            }
            None => TurnResponse::chat("Nothing to cancel.", metadata),
        }
    }

    async fn handle_merge(
        &self,
        message: &str,
        session_id: &str,
        user_id: &str,
        action: PendingAction,
        analysis: &IntentAnalysis,
        options: &ProcessOptions,
        mut metadata: TurnMetadata,
    ) -> TurnResponse {
        let catalog = self.catalog.read().await;
        let Some(definition) = catalog.get(&action.action_id).cloned() else {
            drop(catalog);
            self.pending.delete(session_id).await;
            return TurnResponse::chat(
                "That action is no longer available; I've dropped it.",
                metadata,
            );
        };
        drop(catalog);

        // Classifier-extracted data first; a full extraction pass over
        // the outstanding fields when the classifier found nothing.
        let mut partial: Map<String, serde_json::Value> = analysis.extracted_data.clone();
        if partial.is_empty() {
            let outstanding: Vec<_> = definition
                .fields
                .iter()
                .filter(|f| action.missing_fields.contains(&f.name))
                .cloned()
                .collect();
            partial = self
                .extractor
                .extract(message, &options.recent_turns, &outstanding, user_id)
                .await;
        } else {
            self.extractor
                .resolve_relationships(&definition.fields, &mut partial, user_id)
                .await;
        }

        let updated = match self
            .pending
            .update_params(session_id, &partial, &definition.fields)
            .await
        {
            Ok(Some(updated)) => updated,
            Ok(None) => {
                return TurnResponse::chat("There's no action in progress anymore.", metadata);
            }
            Err(err) => {
                warn!(session = session_id, error = %err, "merge failed");
                return TurnResponse::chat(
                    "I couldn't attach that to the action in progress.",
                    metadata,
                );
            }
        };

        metadata.active_workflow = Some(WorkflowSnapshot::from(&updated));

        let content = if updated.ready_to_execute {
            format!(
                "\"{}\" has everything it needs. Shall I go ahead?",
                updated.label
            )
        } else {
            format!(
                "Got it. I still need: {}.",
                updated.missing_fields.join(", ")
            )
        };
        TurnResponse::chat(content, metadata)
    }

    async fn handle_new_request(
        &self,
        message: &str,
        session_id: &str,
        user_id: &str,
        analysis: &IntentAnalysis,
        options: &ProcessOptions,
        mut metadata: TurnMetadata,
    ) -> TurnResponse {
        let catalog = self.catalog.read().await;
        let ranked = catalog.match_ranked(message, analysis);

        if ranked.is_empty() {
            drop(catalog);
            let content = self.chat_reply(message, analysis).await;
            return TurnResponse::chat(content, metadata);
        }

        // Exactly-tied candidates with no explicit hint: ask instead of
        // guessing. (A tie survived every ranking signal.)
        if analysis.suggested_action_id.is_none()
            && ranked.len() >= 2
            && (ranked[0].score - ranked[1].score).abs() < 0.01
        {
            let options_list: Vec<String> = ranked
                .iter()
                .take(3)
                .enumerate()
                .map(|(i, m)| format!("{}. {}", i + 1, m.definition.label))
                .collect();
            drop(catalog);
            return TurnResponse::chat(
                format!(
                    "I can do a couple of things here. Which did you mean?\n{}",
                    options_list.join("\n")
                ),
                metadata,
            );
        }

        let definition: ActionDefinition = ranked[0].definition.clone();
        drop(catalog);

        let params = self
            .extractor
            .extract(message, &options.recent_turns, &definition.fields, user_id)
            .await;

        let action = PendingAction::from_definition(&definition, params, user_id);

        // An unrelated action in flight is superseded by the new one.
        if let Ok(Some(previous)) = self.pending.get(session_id).await {
            if previous.action_id != action.action_id {
                info!(
                    old = %previous.action_id,
                    new = %action.action_id,
                    "superseding pending action"
                );
            }
        }

        if let Err(err) = self.pending.store(session_id, &action).await {
            warn!(session = session_id, error = %err, "could not persist pending action");
            return TurnResponse::chat("I couldn't start that action, sorry.", metadata);
        }

        // Remote workflows pin the session to the owning node so the
        // remaining turns stay there.
        if let Some(node) = &definition.remote_node {
            self.router.pin_session(session_id, node).await;
        }

        metadata.active_workflow = Some(WorkflowSnapshot::from(&action));

        let content = if action.ready_to_execute {
            format!("Ready to run \"{}\". Shall I go ahead?", action.label)
        } else {
            format!(
                "Starting \"{}\". I still need: {}.",
                action.label,
                action.missing_fields.join(", ")
            )
        };
        TurnResponse::chat(content, metadata)
    }

    /// Plain chat reply for questions and retrieval turns; degrades to
    /// the configured message table when the provider is down.
    async fn chat_reply(&self, message: &str, analysis: &IntentAnalysis) -> String {
        let system = if analysis.context_enhancement.is_empty() {
            "You are a helpful assistant inside an action-fulfillment engine. Answer briefly.".to_string()
        } else {
            format!(
                "You are a helpful assistant inside an action-fulfillment engine. Answer briefly. Context: {}",
                analysis.context_enhancement
            )
        };

        match self.llm.chat(&system, message).await {
            Ok(reply) => reply.content,
            Err(err) => self.degraded_message(&err),
        }
    }

    fn degraded_message(&self, err: &AiServiceError) -> String {
        err.user_message(&self.config.error_messages)
    }
}
