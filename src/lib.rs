//! actionflow - Conversational action fulfillment
//!
//! Turns free-text conversational turns into fully-parameterized,
//! confirmed, executed actions against a domain's entities, tracking
//! partially-filled intent across turns and executing on the federated
//! node that owns the target entity type when it is not this one.
//!
//! ## Architecture
//! One call per turn flows through a fixed pipeline:
//! Message -> IntentClassifier -> ActionCatalog match -> ParameterExtractor
//! -> PendingActionStore merge -> ActionExecutor (local or NodeRouter)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use actionflow::{
//!     ConversationService, EngineConfig, MemoryEntityStore, MemoryKvStore,
//!     MockLlmClient, MockNodeClient, ProcessOptions,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let entities = MemoryEntityStore::shared();
//! let service = ConversationService::builder(EngineConfig::default())
//!     .llm(Arc::new(MockLlmClient::new()))
//!     .kv(MemoryKvStore::shared())
//!     .entity_store(entities.clone())
//!     .entity_search(entities)
//!     .node_client(Arc::new(MockNodeClient::new()))
//!     .build()?;
//!
//! let response = service
//!     .process("create an invoice", "session-1", "user-1", ProcessOptions::default())
//!     .await;
//! println!("{}", response.content);
//! # Ok(())
//! # }
//! ```

// Core error handling
pub mod error;

// Engine configuration
pub mod config;

// Session key-value store
pub mod kv;

// Text-generation collaborator
pub mod llm;

// Entity persistence and search collaborators
pub mod entity;

// Action template registry and discovery
pub mod catalog;

// Intent classification
pub mod intent;

// Parameter extraction and relationship resolution
pub mod extract;

// Cross-turn pending-action state
pub mod pending;

// Action dispatch
pub mod executor;

// Federated node routing
pub mod node;

// The conversational surface
pub mod service;

/// Install a tracing subscriber honoring `RUST_LOG`, for binaries and
/// tests. Calling it again is a no-op.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

// Public re-exports
pub use catalog::{ActionCatalog, ActionDefinition, FieldSpec, FieldType, RelationshipSpec, SchemaProvider};
pub use config::{EngineConfig, LlmConfig};
pub use entity::{EntityRecord, EntitySearch, EntityStore, MemoryEntityStore};
pub use error::{
    AiServiceError, EngineError, ExecutorError, ExtractionError, RoutingError, StoreError,
};
pub use executor::{ActionExecutor, ExecutionContext, ExecutionResult, SideEffectHandler};
pub use extract::{ParameterExtractor, RelationshipResolver};
pub use intent::{Intent, IntentAnalysis, IntentClassifier};
pub use kv::{KvStore, MemoryKvStore};
pub use llm::{HttpLlmClient, LlmClient, MockLlmClient, ToolDefinition};
pub use node::{
    HttpNodeClient, MockNodeClient, NodeClient, NodeDescriptor, NodeRouter, RouteRequest,
    UsageLedger,
};
pub use pending::{PendingAction, PendingActionStore, PendingStatus};
pub use service::{ConversationService, ProcessOptions, TurnMetadata, TurnResponse, WorkflowSnapshot};
