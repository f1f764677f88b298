//! Pending actions
//!
//! A pending action is the session-scoped record of a partially- or
//! fully-specified action awaiting completion or confirmation. Exactly
//! one is active per session; a new unrelated action supersedes any
//! prior one. `missing_fields` is always recomputed from the template
//! schema against the merged params, never patched incrementally, so it
//! cannot drift from the data.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::catalog::{ActionDefinition, FieldSpec};
use crate::error::{StoreError, StoreResult};
use crate::extract::missing_required;
use crate::kv::KvStore;

/// Lifecycle of a pending action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    Incomplete,
    Ready,
    Executed,
    Canceled,
}

/// Session-scoped record of an action in flight
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: String,
    pub action_id: String,
    pub label: String,
    pub description: String,
    pub params: Map<String, Value>,
    pub missing_fields: Vec<String>,
    pub ready_to_execute: bool,
    pub executor: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub status: PendingStatus,
}

impl PendingAction {
    /// Build a fresh pending action from a matched template and the
    /// first round of extracted params.
    pub fn from_definition(
        definition: &ActionDefinition,
        params: Map<String, Value>,
        user_id: &str,
    ) -> Self {
        let missing_fields = missing_required(&definition.fields, &params);
        let ready_to_execute = missing_fields.is_empty();
        Self {
            id: Uuid::new_v4().to_string(),
            action_id: definition.id.clone(),
            label: definition.label.clone(),
            description: definition.description.clone(),
            params,
            missing_fields,
            ready_to_execute,
            executor: definition.executor.clone(),
            user_id: user_id.to_string(),
            created_at: Utc::now(),
            status: if ready_to_execute {
                PendingStatus::Ready
            } else {
                PendingStatus::Incomplete
            },
        }
    }
}

/// Store of the active pending action per session
pub struct PendingActionStore {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
}

fn key_for(session_id: &str) -> String {
    format!("pending_action:{}", session_id)
}

impl PendingActionStore {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub async fn get(&self, session_id: &str) -> StoreResult<Option<PendingAction>> {
        let key = key_for(session_id);
        match self.kv.get(&key).await {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StoreError::Decode {
                    key,
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    pub async fn store(&self, session_id: &str, action: &PendingAction) -> StoreResult<()> {
        let raw = serde_json::to_string(action).map_err(|e| StoreError::Decode {
            key: key_for(session_id),
            message: e.to_string(),
        })?;
        self.kv.set(&key_for(session_id), raw, Some(self.ttl)).await;
        Ok(())
    }

    pub async fn delete(&self, session_id: &str) {
        self.kv.delete(&key_for(session_id)).await;
    }

    /// Merge newly extracted params into the active pending action and
    /// rederive its readiness against the template schema.
    ///
    /// Returns the updated action, or None when the session has no
    /// active pending action.
    pub async fn update_params(
        &self,
        session_id: &str,
        partial: &Map<String, Value>,
        schema: &[FieldSpec],
    ) -> StoreResult<Option<PendingAction>> {
        let Some(mut action) = self.get(session_id).await? else {
            return Ok(None);
        };

        let rekeyed = rekey_bare_fields(partial, &action.missing_fields);
        deep_merge(&mut action.params, &rekeyed);

        action.missing_fields = missing_required(schema, &action.params);
        action.ready_to_execute = action.missing_fields.is_empty();
        if matches!(action.status, PendingStatus::Incomplete | PendingStatus::Ready) {
            action.status = if action.ready_to_execute {
                PendingStatus::Ready
            } else {
                PendingStatus::Incomplete
            };
        }

        debug!(
            session = session_id,
            missing = ?action.missing_fields,
            "merged params into pending action"
        );

        self.store(session_id, &action).await?;
        Ok(Some(action))
    }

    /// Flag the action executed. The caller clears the entry afterwards;
    /// keeping the flagged record makes the state transition observable.
    pub async fn mark_executed(&self, session_id: &str) -> StoreResult<Option<PendingAction>> {
        let Some(mut action) = self.get(session_id).await? else {
            return Ok(None);
        };
        action.status = PendingStatus::Executed;
        self.store(session_id, &action).await?;
        Ok(Some(action))
    }
}

/// Re-key bare common fields onto their prefixed missing-field form.
///
/// When `customer_name` is missing and the extraction supplies `name`,
/// the value belongs on `customer_name`; merging it bare would collide
/// with an unrelated top-level `name` field. The prefix is inferred
/// only when exactly one missing field matches `{prefix}_{key}`.
fn rekey_bare_fields(partial: &Map<String, Value>, missing: &[String]) -> Map<String, Value> {
    let mut out = Map::new();

    for (key, value) in partial {
        if missing.iter().any(|m| m == key) {
            out.insert(key.clone(), value.clone());
            continue;
        }

        let suffix = format!("_{}", key);
        let mut prefixed = missing.iter().filter(|m| m.ends_with(&suffix));
        match (prefixed.next(), prefixed.next()) {
            (Some(target), None) => {
                debug!(from = %key, to = %target, "re-keyed bare field onto missing prefix");
                out.insert(target.clone(), value.clone());
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }

    out
}

/// Deep merge `incoming` into `base`. Objects merge recursively, other
/// values overwrite. Null and empty values are skipped: a merge can
/// only add information, which keeps `missing_fields` shrinking.
fn deep_merge(base: &mut Map<String, Value>, incoming: &Map<String, Value>) {
    for (key, value) in incoming {
        match value {
            Value::Null => continue,
            Value::String(s) if s.trim().is_empty() => continue,
            Value::Object(incoming_obj) => {
                if let Some(Value::Object(existing)) = base.get_mut(key) {
                    deep_merge(existing, incoming_obj);
                } else {
                    base.insert(key.clone(), value.clone());
                }
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}
