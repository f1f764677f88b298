//! Peer-node HTTP client
//!
//! Federated nodes expose `GET /collections` for schema discovery and
//! `POST /execute` for remote action execution, bearer-token
//! authenticated. Execute responses arrive wrapped in a
//! `{node, status_code, data: {result}}` envelope that is unwrapped
//! here; callers only ever see the inner result.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::catalog::FieldSpec;
use crate::error::{RoutingError, RoutingResult};

/// A registered federated node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub slug: String,
    pub base_url: String,
    pub token: String,
}

/// One remotely-published entity collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    pub entity_class: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

/// Unwrapped result of a remote execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteOutcome {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<String>,
    /// Usage/cost units the remote node spent on our behalf
    #[serde(default)]
    pub usage_units: Option<u64>,
}

/// Transport to peer nodes
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn list_collections(&self, node: &NodeDescriptor) -> RoutingResult<Vec<CollectionDescriptor>>;

    async fn execute(
        &self,
        node: &NodeDescriptor,
        executor_id: &str,
        payload: Value,
    ) -> RoutingResult<RemoteOutcome>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

#[derive(Deserialize)]
struct CollectionsResponse {
    collections: Vec<CollectionDescriptor>,
}

#[derive(Deserialize)]
struct ExecuteEnvelope {
    #[allow(dead_code)]
    node: Option<String>,
    #[allow(dead_code)]
    status_code: Option<u16>,
    data: Option<EnvelopeData>,
}

#[derive(Deserialize)]
struct EnvelopeData {
    result: RemoteOutcome,
}

pub struct HttpNodeClient {
    client: reqwest::Client,
    timeout_secs: u64,
}

impl HttpNodeClient {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            timeout_secs: timeout.as_secs(),
        }
    }

    fn endpoint(&self, node: &NodeDescriptor, path: &str) -> RoutingResult<Url> {
        Url::parse(&node.base_url)
            .and_then(|base| base.join(path))
            .map_err(|_| RoutingError::UnknownNode {
                node: node.slug.clone(),
            })
    }

    fn map_transport_error(&self, node: &NodeDescriptor, err: reqwest::Error) -> RoutingError {
        if err.is_timeout() {
            RoutingError::Timeout {
                node: node.slug.clone(),
                seconds: self.timeout_secs,
            }
        } else {
            RoutingError::Network {
                node: node.slug.clone(),
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn list_collections(&self, node: &NodeDescriptor) -> RoutingResult<Vec<CollectionDescriptor>> {
        let url = self.endpoint(node, "collections")?;
        let response = self
            .client
            .get(url)
            .bearer_auth(&node.token)
            .send()
            .await
            .map_err(|e| self.map_transport_error(node, e))?;

        if !response.status().is_success() {
            return Err(RoutingError::Remote {
                node: node.slug.clone(),
                message: format!("collections returned {}", response.status()),
            });
        }

        let body: CollectionsResponse =
            response.json().await.map_err(|_| RoutingError::Envelope {
                node: node.slug.clone(),
            })?;
        Ok(body.collections)
    }

    async fn execute(
        &self,
        node: &NodeDescriptor,
        executor_id: &str,
        payload: Value,
    ) -> RoutingResult<RemoteOutcome> {
        let url = self.endpoint(node, "execute")?;
        let body = serde_json::json!({
            "executor": executor_id,
            "params": payload,
        });

        let response = self
            .client
            .post(url)
            .bearer_auth(&node.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_transport_error(node, e))?;

        if !response.status().is_success() {
            return Err(RoutingError::Remote {
                node: node.slug.clone(),
                message: format!("execute returned {}", response.status()),
            });
        }

        let envelope: ExecuteEnvelope =
            response.json().await.map_err(|_| RoutingError::Envelope {
                node: node.slug.clone(),
            })?;

        envelope
            .data
            .map(|d| d.result)
            .ok_or_else(|| RoutingError::Envelope {
                node: node.slug.clone(),
            })
    }
}

// ============================================================================
// Scripted mock for tests
// ============================================================================

/// Mock node client with per-slug scripted outcomes.
#[derive(Default)]
pub struct MockNodeClient {
    collections: Mutex<HashMap<String, Vec<CollectionDescriptor>>>,
    failing_collections: Mutex<Vec<String>>,
    outcomes: Mutex<HashMap<String, Vec<RoutingResult<RemoteOutcome>>>>,
    /// (slug, executor_id, payload) tuples, in call order
    calls: Mutex<Vec<(String, String, Value)>>,
}

impl MockNodeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_collections(&self, slug: &str, collections: Vec<CollectionDescriptor>) {
        self.collections
            .lock()
            .unwrap()
            .insert(slug.to_string(), collections);
    }

    /// Make `list_collections` fail for a slug.
    pub fn fail_collections(&self, slug: &str) {
        self.failing_collections.lock().unwrap().push(slug.to_string());
    }

    pub fn push_outcome(&self, slug: &str, outcome: RoutingResult<RemoteOutcome>) {
        self.outcomes
            .lock()
            .unwrap()
            .entry(slug.to_string())
            .or_default()
            .push(outcome);
    }

    pub fn recorded_calls(&self) -> Vec<(String, String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl NodeClient for MockNodeClient {
    async fn list_collections(&self, node: &NodeDescriptor) -> RoutingResult<Vec<CollectionDescriptor>> {
        if self.failing_collections.lock().unwrap().contains(&node.slug) {
            return Err(RoutingError::Network {
                node: node.slug.clone(),
                message: "connection refused".to_string(),
            });
        }
        Ok(self
            .collections
            .lock()
            .unwrap()
            .get(&node.slug)
            .cloned()
            .unwrap_or_default())
    }

    async fn execute(
        &self,
        node: &NodeDescriptor,
        executor_id: &str,
        payload: Value,
    ) -> RoutingResult<RemoteOutcome> {
        self.calls.lock().unwrap().push((
            node.slug.clone(),
            executor_id.to_string(),
            payload,
        ));

        let mut outcomes = self.outcomes.lock().unwrap();
        match outcomes.get_mut(&node.slug).and_then(|v| {
            if v.is_empty() {
                None
            } else {
                Some(v.remove(0))
            }
        }) {
            Some(outcome) => outcome,
            None => Ok(RemoteOutcome {
                success: true,
                data: Value::Null,
                error: None,
                usage_units: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(slug: &str) -> NodeDescriptor {
        NodeDescriptor {
            slug: slug.to_string(),
            base_url: format!("https://{}.example.com/api/", slug),
            token: "secret".to_string(),
        }
    }

    #[test]
    fn test_envelope_shape_parses() {
        let raw = serde_json::json!({
            "node": "node-b",
            "status_code": 200,
            "data": { "result": { "success": true, "data": {"id": "42"}, "usage_units": 12 } }
        });
        let envelope: ExecuteEnvelope = serde_json::from_value(raw).unwrap();
        let result = envelope.data.unwrap().result;
        assert!(result.success);
        assert_eq!(result.usage_units, Some(12));
    }

    #[tokio::test]
    async fn test_mock_records_calls() {
        let mock = MockNodeClient::new();
        let descriptor = node("node-b");

        mock.execute(&descriptor, "create_entity", serde_json::json!({"name": "x"}))
            .await
            .unwrap();

        let calls = mock.recorded_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "node-b");
        assert_eq!(calls[0].1, "create_entity");
    }

    #[tokio::test]
    async fn test_mock_scripted_failure() {
        let mock = MockNodeClient::new();
        mock.push_outcome(
            "node-b",
            Err(RoutingError::Timeout {
                node: "node-b".to_string(),
                seconds: 15,
            }),
        );

        let err = mock
            .execute(&node("node-b"), "create_entity", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::Timeout { .. }));
    }
}
