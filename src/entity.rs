//! Entity persistence and search collaborators
//!
//! The engine never owns entity storage. It talks to two traits: a
//! persistence collaborator (find/create/save/declared fields) and a
//! search collaborator used for relationship resolution. Search is
//! scoped to the requesting user; tiers are semantic first, substring
//! on a default field second.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// A stored entity, attribute map plus identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub class: String,
    pub display_name: String,
    pub attributes: Map<String, Value>,
}

/// Entity persistence collaborator
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn find_by_id(&self, class: &str, id: &str) -> StoreResult<Option<EntityRecord>>;

    async fn create(
        &self,
        class: &str,
        attributes: Map<String, Value>,
        user_id: &str,
    ) -> StoreResult<EntityRecord>;

    async fn save(&self, record: EntityRecord) -> StoreResult<EntityRecord>;

    /// Field names the class declares, for schema-less fallbacks.
    async fn declared_fields(&self, class: &str) -> StoreResult<Vec<String>>;
}

/// Relationship search collaborator.
///
/// `semantic` may be unsupported for a class; callers check
/// `supports_semantic` and fall back to `substring` on a default field.
#[async_trait]
pub trait EntitySearch: Send + Sync {
    fn supports_semantic(&self, class: &str) -> bool;

    async fn semantic(
        &self,
        class: &str,
        query: &str,
        user_id: &str,
    ) -> StoreResult<Option<EntityRecord>>;

    async fn substring(
        &self,
        class: &str,
        field: &str,
        query: &str,
        user_id: &str,
    ) -> StoreResult<Option<EntityRecord>>;
}

// ============================================================================
// In-memory implementation (tests and demos)
// ============================================================================

/// In-memory entity store keyed by (class, id), ownership tracked per user.
#[derive(Default)]
pub struct MemoryEntityStore {
    records: RwLock<HashMap<String, Vec<OwnedRecord>>>,
}

#[derive(Clone)]
struct OwnedRecord {
    record: EntityRecord,
    user_id: String,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Seed a record directly, for test setup.
    pub async fn seed(&self, record: EntityRecord, user_id: &str) {
        let mut map = self.records.write().await;
        map.entry(record.class.clone()).or_default().push(OwnedRecord {
            record,
            user_id: user_id.to_string(),
        });
    }

    pub async fn count(&self, class: &str) -> usize {
        self.records
            .read()
            .await
            .get(class)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

fn display_name_from(attributes: &Map<String, Value>) -> String {
    for key in ["name", "title", "label"] {
        if let Some(Value::String(s)) = attributes.get(key) {
            return s.clone();
        }
    }
    String::new()
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn find_by_id(&self, class: &str, id: &str) -> StoreResult<Option<EntityRecord>> {
        let map = self.records.read().await;
        Ok(map
            .get(class)
            .and_then(|v| v.iter().find(|o| o.record.id == id))
            .map(|o| o.record.clone()))
    }

    async fn create(
        &self,
        class: &str,
        attributes: Map<String, Value>,
        user_id: &str,
    ) -> StoreResult<EntityRecord> {
        let record = EntityRecord {
            id: Uuid::new_v4().to_string(),
            class: class.to_string(),
            display_name: display_name_from(&attributes),
            attributes,
        };
        self.seed(record.clone(), user_id).await;
        Ok(record)
    }

    async fn save(&self, record: EntityRecord) -> StoreResult<EntityRecord> {
        let mut map = self.records.write().await;
        let slot = map
            .get_mut(&record.class)
            .and_then(|v| v.iter_mut().find(|o| o.record.id == record.id))
            .ok_or_else(|| StoreError::EntityNotFound {
                class: record.class.clone(),
                id: record.id.clone(),
            })?;
        slot.record = record.clone();
        Ok(record)
    }

    async fn declared_fields(&self, class: &str) -> StoreResult<Vec<String>> {
        let map = self.records.read().await;
        let mut fields: Vec<String> = map
            .get(class)
            .into_iter()
            .flatten()
            .flat_map(|o| o.record.attributes.keys().cloned())
            .collect();
        fields.sort();
        fields.dedup();
        Ok(fields)
    }
}

#[async_trait]
impl EntitySearch for MemoryEntityStore {
    fn supports_semantic(&self, _class: &str) -> bool {
        false
    }

    async fn semantic(
        &self,
        _class: &str,
        _query: &str,
        _user_id: &str,
    ) -> StoreResult<Option<EntityRecord>> {
        Ok(None)
    }

    async fn substring(
        &self,
        class: &str,
        field: &str,
        query: &str,
        user_id: &str,
    ) -> StoreResult<Option<EntityRecord>> {
        let needle = query.to_lowercase();
        let map = self.records.read().await;
        Ok(map.get(class).and_then(|records| {
            records
                .iter()
                .filter(|o| o.user_id == user_id)
                .find(|o| {
                    o.record
                        .attributes
                        .get(field)
                        .and_then(Value::as_str)
                        .map(|s| s.to_lowercase().contains(&needle))
                        .unwrap_or(false)
                })
                .map(|o| o.record.clone())
        }))
    }
}
