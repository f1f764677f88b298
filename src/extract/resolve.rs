//! Relationship resolution
//!
//! A relationship field extracted as a plain name ("John") must become
//! an entity identifier before execution. Resolution tiers: semantic
//! search where the collection supports it, substring search on the
//! default field otherwise, autonomous creation as a last resort when
//! the target type allows it. Targets owned by a remote node are never
//! guessed locally: the raw name is preserved and tagged for
//! remote-side resolution.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::catalog::FieldSpec;
use crate::entity::{EntitySearch, EntityStore};

/// Marker suffix tagging a field deferred to the owning node.
pub const DEFERRED_SUFFIX: &str = "_pending_resolution";

pub struct RelationshipResolver {
    search: Arc<dyn EntitySearch>,
    store: Arc<dyn EntityStore>,
}

impl RelationshipResolver {
    pub fn new(search: Arc<dyn EntitySearch>, store: Arc<dyn EntityStore>) -> Self {
        Self { search, store }
    }

    /// Resolve every relationship field in `params` in place.
    ///
    /// Search or creation failures degrade to leaving the raw value;
    /// they never fail the turn.
    pub async fn resolve(&self, schema: &[FieldSpec], params: &mut Map<String, Value>, user_id: &str) {
        for field in schema {
            let Some(rel) = &field.relationship else {
                continue;
            };

            let Some(raw) = params.get(&field.name).and_then(Value::as_str) else {
                continue;
            };
            if looks_like_identifier(raw) {
                continue;
            }
            let raw = raw.to_string();

            if let Some(node) = &rel.source_node {
                // Remote-owned target: defer, do not guess locally.
                params.insert(
                    format!("{}{}", field.name, DEFERRED_SUFFIX),
                    Value::String(node.clone()),
                );
                debug!(field = %field.name, node = %node, "deferred relationship to owning node");
                continue;
            }

            match self.resolve_local(rel, &raw, user_id).await {
                Some(id) => {
                    params.insert(field.name.clone(), Value::String(id));
                }
                None => {
                    warn!(field = %field.name, value = %raw, "relationship left unresolved");
                }
            }
        }
    }

    async fn resolve_local(
        &self,
        rel: &crate::catalog::RelationshipSpec,
        raw: &str,
        user_id: &str,
    ) -> Option<String> {
        if self.search.supports_semantic(&rel.target_class) {
            match self.search.semantic(&rel.target_class, raw, user_id).await {
                Ok(Some(record)) => return Some(record.id),
                Ok(None) => {}
                Err(err) => warn!(class = %rel.target_class, error = %err, "semantic search failed"),
            }
        }

        match self
            .search
            .substring(&rel.target_class, &rel.search_field, raw, user_id)
            .await
        {
            Ok(Some(record)) => return Some(record.id),
            Ok(None) => {}
            Err(err) => warn!(class = %rel.target_class, error = %err, "substring search failed"),
        }

        if rel.autonomous_create {
            let mut attributes = Map::new();
            attributes.insert(rel.search_field.clone(), Value::String(raw.to_string()));
            match self.store.create(&rel.target_class, attributes, user_id).await {
                Ok(record) => {
                    debug!(class = %rel.target_class, id = %record.id, "created relationship target");
                    return Some(record.id);
                }
                Err(err) => warn!(class = %rel.target_class, error = %err, "autonomous create failed"),
            }
        }

        None
    }
}

/// Values that are already identifiers are not re-resolved: numeric
/// keys and UUIDs pass through untouched.
fn looks_like_identifier(value: &str) -> bool {
    value.parse::<i64>().is_ok() || Uuid::parse_str(value).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FieldSpec, FieldType, RelationshipSpec};
    use crate::entity::MemoryEntityStore;
    use serde_json::json;

    fn customer_field(source_node: Option<&str>, autonomous_create: bool) -> FieldSpec {
        FieldSpec {
            name: "customer".to_string(),
            field_type: FieldType::Text,
            required: true,
            description: String::new(),
            relationship: Some(RelationshipSpec {
                target_class: "Customer".to_string(),
                source_node: source_node.map(|s| s.to_string()),
                autonomous_create,
                search_field: "name".to_string(),
            }),
            alternatives: Vec::new(),
            item_schema: Vec::new(),
        }
    }

    fn resolver(store: Arc<MemoryEntityStore>) -> RelationshipResolver {
        RelationshipResolver::new(store.clone(), store)
    }

    #[tokio::test]
    async fn test_substring_resolution() {
        let store = MemoryEntityStore::shared();
        let existing = store
            .create(
                "Customer",
                json!({"name": "John Smith"}).as_object().cloned().unwrap(),
                "u1",
            )
            .await
            .unwrap();

        let mut params = json!({"customer": "John"}).as_object().cloned().unwrap();
        resolver(store)
            .resolve(&[customer_field(None, false)], &mut params, "u1")
            .await;

        assert_eq!(params["customer"], Value::String(existing.id));
    }

    #[tokio::test]
    async fn test_autonomous_create_when_unmatched() {
        let store = MemoryEntityStore::shared();
        let mut params = json!({"customer": "Brand New Co"}).as_object().cloned().unwrap();

        resolver(store.clone())
            .resolve(&[customer_field(None, true)], &mut params, "u1")
            .await;

        assert_eq!(store.count("Customer").await, 1);
        // The raw name was replaced by the new record's id.
        let id = params["customer"].as_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn test_remote_target_is_deferred() {
        let store = MemoryEntityStore::shared();
        let mut params = json!({"customer": "John"}).as_object().cloned().unwrap();

        resolver(store.clone())
            .resolve(&[customer_field(Some("node-b"), true)], &mut params, "u1")
            .await;

        // Raw name preserved, marker added, nothing created locally.
        assert_eq!(params["customer"], Value::String("John".to_string()));
        assert_eq!(
            params[&format!("customer{}", DEFERRED_SUFFIX)],
            Value::String("node-b".to_string())
        );
        assert_eq!(store.count("Customer").await, 0);
    }

    #[tokio::test]
    async fn test_identifier_values_pass_through() {
        let store = MemoryEntityStore::shared();
        let uuid = Uuid::new_v4().to_string();
        let mut params = json!({"customer": uuid}).as_object().cloned().unwrap();

        resolver(store.clone())
            .resolve(&[customer_field(None, true)], &mut params, "u1")
            .await;

        assert_eq!(params["customer"], Value::String(uuid));
        assert_eq!(store.count("Customer").await, 0);
    }

    #[tokio::test]
    async fn test_unresolved_without_create_leaves_raw() {
        let store = MemoryEntityStore::shared();
        let mut params = json!({"customer": "Nobody"}).as_object().cloned().unwrap();

        resolver(store)
            .resolve(&[customer_field(None, false)], &mut params, "u1")
            .await;

        assert_eq!(params["customer"], Value::String("Nobody".to_string()));
    }
}
