//! Dynamic action discovery
//!
//! Entity types opt into conversational creation by implementing the
//! `SchemaProvider` capability: describe your fields, create a record
//! from a field map. Discovery enumerates registered providers plus
//! every federated node's published collections and synthesizes a
//! "create <Entity>" template for each. The result replaces the
//! previous discovered set wholesale.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::entity::EntityRecord;
use crate::error::StoreResult;
use crate::node::client::{NodeClient, NodeDescriptor};

use super::{ActionDefinition, FieldSpec};

/// Capability an entity type implements to be conversationally creatable
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// Entity class this provider owns (e.g., "Invoice")
    fn entity_class(&self) -> &str;

    /// Field schema shown to the extractor
    fn describe_fields(&self) -> Vec<FieldSpec>;

    /// Create a record from resolved fields
    async fn create_from_fields(
        &self,
        params: &Map<String, Value>,
        user_id: &str,
    ) -> StoreResult<EntityRecord>;
}

/// Synthesize the create-template for one entity class.
///
/// Dynamic templates carry no keyword triggers: they match by intent
/// only, since trigger words are unreliable across arbitrary entity
/// names.
pub fn synthesize_create_action(
    class: &str,
    fields: Vec<FieldSpec>,
    node: Option<&str>,
) -> ActionDefinition {
    let entity_class = match node {
        Some(slug) => format!("{}:{}", slug, class),
        None => class.to_string(),
    };

    ActionDefinition {
        id: format!("create_{}", class.to_lowercase()),
        label: format!("Create {}", class),
        description: format!("Create a new {} record", class),
        triggers: Vec::new(),
        fields,
        executor: "create_entity".to_string(),
        entity_class: Some(entity_class),
        remote_node: node.map(|s| s.to_string()),
        match_by_intent: true,
    }
}

/// Enumerate local providers and remote collections into a fresh
/// discovered set. A node that fails discovery is skipped, not fatal;
/// re-running produces the same result for the same inputs.
pub async fn discover(
    providers: &[Arc<dyn SchemaProvider>],
    nodes: &[NodeDescriptor],
    client: &dyn NodeClient,
) -> Vec<ActionDefinition> {
    let mut actions = Vec::new();

    for provider in providers {
        actions.push(synthesize_create_action(
            provider.entity_class(),
            provider.describe_fields(),
            None,
        ));
    }

    for node in nodes {
        match client.list_collections(node).await {
            Ok(collections) => {
                for collection in collections {
                    if !collection.methods.iter().any(|m| m == "create") {
                        continue;
                    }
                    debug!(node = %node.slug, class = %collection.entity_class, "discovered remote collection");
                    actions.push(synthesize_create_action(
                        &collection.entity_class,
                        collection.fields,
                        Some(&node.slug),
                    ));
                }
            }
            Err(err) => {
                warn!(node = %node.slug, error = %err, "collection discovery failed, skipping node");
            }
        }
    }

    actions
}
