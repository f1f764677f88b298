//! Federated node routing
//!
//! Entities live on the node that owns their type. The router decides
//! whether a request leaves this node, forwards it with loop-safe
//! semantics (forwarding depth is at most one, unconditionally), fans
//! calls out across the fleet, and pins a session to the node running
//! its active workflow so consecutive turns do not hop nodes mid-way.

pub mod client;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{RoutingError, RoutingResult};
use crate::executor::ExecutionResult;
use crate::kv::KvStore;

pub use client::{
    CollectionDescriptor, HttpNodeClient, MockNodeClient, NodeClient, NodeDescriptor, RemoteOutcome,
};

/// Routing signals for one request, in priority order
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteRequest<'a> {
    /// Explicit node designation on the request
    pub explicit_node: Option<&'a str>,
    /// Source-node annotation on the target entity
    pub entity_source_node: Option<&'a str>,
    /// Entity class, possibly composite (`nodeA:Invoice`)
    pub entity_class: Option<&'a str>,
    /// Collection identifier for the ownership lookup
    pub collection: Option<&'a str>,
    /// Inbound already-forwarded marker
    pub already_forwarded: bool,
}

/// Split a composite `node:Class` identifier.
pub fn split_composite(entity_class: &str) -> (Option<&str>, &str) {
    match entity_class.split_once(':') {
        Some((node, class)) if !node.is_empty() && !class.is_empty() => (Some(node), class),
        _ => (None, entity_class),
    }
}

/// Per-user ledger of usage units, local and reconciled-from-remote.
#[derive(Default)]
pub struct UsageLedger {
    spent: RwLock<HashMap<String, u64>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn credit(&self, user_id: &str, units: u64) {
        let mut spent = self.spent.write().await;
        *spent.entry(user_id.to_string()).or_insert(0) += units;
    }

    pub async fn total(&self, user_id: &str) -> u64 {
        self.spent.read().await.get(user_id).copied().unwrap_or(0)
    }
}

/// The node router
pub struct NodeRouter {
    nodes: HashMap<String, NodeDescriptor>,
    /// Collection identifier -> owning node slug; externally sourced,
    /// never mutated here.
    ownership: HashMap<String, String>,
    client: Arc<dyn NodeClient>,
    kv: Arc<dyn KvStore>,
    pin_ttl: Duration,
    ledger: Arc<UsageLedger>,
}

fn pin_key(session_id: &str) -> String {
    format!("session_node_pin:{}", session_id)
}

impl NodeRouter {
    pub fn new(
        nodes: Vec<NodeDescriptor>,
        ownership: HashMap<String, String>,
        client: Arc<dyn NodeClient>,
        kv: Arc<dyn KvStore>,
        pin_ttl: Duration,
    ) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.slug.clone(), n)).collect(),
            ownership,
            client,
            kv,
            pin_ttl,
            ledger: Arc::new(UsageLedger::new()),
        }
    }

    pub fn ledger(&self) -> Arc<UsageLedger> {
        self.ledger.clone()
    }

    pub fn descriptors(&self) -> Vec<NodeDescriptor> {
        self.nodes.values().cloned().collect()
    }

    /// Decide whether this request leaves the local node.
    ///
    /// The forwarded marker is checked first and disables forwarding
    /// regardless of every other signal; this guarantees forwarding
    /// depth <= 1 and rules out cycles between peers.
    pub fn should_route_remote(&self, request: &RouteRequest) -> Option<String> {
        if request.already_forwarded {
            debug!("request already forwarded once, handling locally");
            return None;
        }

        if let Some(node) = request.explicit_node {
            return Some(node.to_string());
        }

        if let Some(node) = request.entity_source_node {
            return Some(node.to_string());
        }

        if let Some(class) = request.entity_class {
            if let (Some(node), _) = split_composite(class) {
                return Some(node.to_string());
            }
        }

        if let Some(collection) = request.collection {
            if let Some(node) = self.ownership.get(collection) {
                return Some(node.clone());
            }
        }

        None
    }

    /// Execute on a specific node. The outgoing payload carries the
    /// forwarded marker, and any composite entity class is stripped to
    /// its bare form before leaving this node.
    pub async fn execute_on(
        &self,
        slug: &str,
        executor_id: &str,
        mut payload: Value,
        user_id: &str,
    ) -> RoutingResult<ExecutionResult> {
        let node = self.nodes.get(slug).ok_or_else(|| RoutingError::UnknownNode {
            node: slug.to_string(),
        })?;

        if let Some(map) = payload.as_object_mut() {
            map.insert("forwarded".to_string(), Value::Bool(true));
            if let Some(class) = map.get("entity_class").and_then(Value::as_str) {
                let (_, bare) = split_composite(class);
                let bare = bare.to_string();
                map.insert("entity_class".to_string(), Value::String(bare));
            }
        }

        info!(node = slug, executor = executor_id, "forwarding execution to remote node");
        let outcome = self.client.execute(node, executor_id, payload).await?;

        if let Some(units) = outcome.usage_units {
            // Remote nodes report what they spent on our behalf;
            // reconcile it against the initiating user's ledger.
            self.ledger.credit(user_id, units).await;
        }

        Ok(ExecutionResult::from_remote(slug, outcome))
    }

    /// Run an executor against every known node (or a subset).
    /// One node's failure never blocks collection of the others.
    pub async fn execute_on_all(
        &self,
        executor_id: &str,
        payload: Value,
        parallel: bool,
        node_ids: Option<&[String]>,
        user_id: &str,
    ) -> HashMap<String, ExecutionResult> {
        let slugs: Vec<String> = match node_ids {
            Some(ids) => ids.to_vec(),
            None => self.nodes.keys().cloned().collect(),
        };

        let mut results = HashMap::new();

        if parallel {
            let calls = slugs.iter().map(|slug| {
                let payload = payload.clone();
                async move {
                    let result = self.execute_on(slug, executor_id, payload, user_id).await;
                    (slug.clone(), result)
                }
            });
            for (slug, result) in join_all(calls).await {
                results.insert(slug, flatten(result));
            }
        } else {
            for slug in &slugs {
                let result = self
                    .execute_on(slug, executor_id, payload.clone(), user_id)
                    .await;
                results.insert(slug.clone(), flatten(result));
            }
        }

        results
    }

    /// Pin the session's workflow to a node for subsequent turns.
    pub async fn pin_session(&self, session_id: &str, slug: &str) {
        self.kv
            .set(&pin_key(session_id), slug.to_string(), Some(self.pin_ttl))
            .await;
        debug!(session = session_id, node = slug, "pinned session to node");
    }

    pub async fn pinned_node(&self, session_id: &str) -> Option<String> {
        self.kv.get(&pin_key(session_id)).await
    }

    pub async fn clear_pin(&self, session_id: &str) {
        self.kv.delete(&pin_key(session_id)).await;
    }
}

fn flatten(result: RoutingResult<ExecutionResult>) -> ExecutionResult {
    match result {
        Ok(result) => result,
        Err(err) => {
            warn!(node = err.node(), error = %err, "fan-out call failed");
            ExecutionResult {
                success: false,
                message: format!("Node {} did not respond.", err.node()),
                data: Value::Null,
                error: Some(err.to_string()),
                node: Some(err.node().to_string()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use serde_json::json;

    fn descriptor(slug: &str) -> NodeDescriptor {
        NodeDescriptor {
            slug: slug.to_string(),
            base_url: format!("https://{}.example.com/", slug),
            token: "t".to_string(),
        }
    }

    fn router_with(client: Arc<MockNodeClient>) -> NodeRouter {
        let mut ownership = HashMap::new();
        ownership.insert("shipments".to_string(), "node-b".to_string());
        NodeRouter::new(
            vec![descriptor("node-a"), descriptor("node-b")],
            ownership,
            client,
            MemoryKvStore::shared(),
            Duration::from_secs(3600),
        )
    }

    #[test]
    fn test_split_composite() {
        assert_eq!(split_composite("nodeA:Invoice"), (Some("nodeA"), "Invoice"));
        assert_eq!(split_composite("Invoice"), (None, "Invoice"));
        assert_eq!(split_composite(":Invoice"), (None, ":Invoice"));
    }

    #[test]
    fn test_routing_priority_order() {
        let router = router_with(Arc::new(MockNodeClient::new()));

        // Explicit designation beats everything below it.
        let request = RouteRequest {
            explicit_node: Some("node-a"),
            entity_source_node: Some("node-b"),
            entity_class: Some("node-b:Invoice"),
            collection: Some("shipments"),
            already_forwarded: false,
        };
        assert_eq!(router.should_route_remote(&request).as_deref(), Some("node-a"));

        // Then the entity's source-node annotation.
        let request = RouteRequest {
            entity_source_node: Some("node-b"),
            entity_class: Some("node-a:Invoice"),
            ..Default::default()
        };
        assert_eq!(router.should_route_remote(&request).as_deref(), Some("node-b"));

        // Then the composite identifier.
        let request = RouteRequest {
            entity_class: Some("node-b:Invoice"),
            ..Default::default()
        };
        assert_eq!(router.should_route_remote(&request).as_deref(), Some("node-b"));

        // Then the ownership lookup.
        let request = RouteRequest {
            collection: Some("shipments"),
            ..Default::default()
        };
        assert_eq!(router.should_route_remote(&request).as_deref(), Some("node-b"));

        // No signal: local.
        assert_eq!(router.should_route_remote(&RouteRequest::default()), None);
    }

    #[test]
    fn test_forwarded_marker_disables_routing_unconditionally() {
        let router = router_with(Arc::new(MockNodeClient::new()));
        let request = RouteRequest {
            explicit_node: Some("node-b"),
            entity_source_node: Some("node-b"),
            entity_class: Some("node-b:Invoice"),
            collection: Some("shipments"),
            already_forwarded: true,
        };
        assert_eq!(router.should_route_remote(&request), None);
    }

    #[tokio::test]
    async fn test_execute_on_strips_composite_and_marks_forwarded() {
        let client = Arc::new(MockNodeClient::new());
        let router = router_with(client.clone());

        router
            .execute_on(
                "node-b",
                "create_entity",
                json!({"entity_class": "node-b:Shipment", "destination": "Oslo"}),
                "u1",
            )
            .await
            .unwrap();

        let calls = client.recorded_calls();
        assert_eq!(calls.len(), 1);
        let payload = &calls[0].2;
        assert_eq!(payload["entity_class"], "Shipment");
        assert_eq!(payload["forwarded"], true);
    }

    #[tokio::test]
    async fn test_execute_on_unknown_node() {
        let router = router_with(Arc::new(MockNodeClient::new()));
        let err = router
            .execute_on("node-z", "create_entity", json!({}), "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::UnknownNode { .. }));
    }

    #[tokio::test]
    async fn test_usage_reconciliation() {
        let client = Arc::new(MockNodeClient::new());
        client.push_outcome(
            "node-b",
            Ok(RemoteOutcome {
                success: true,
                data: Value::Null,
                error: None,
                usage_units: Some(42),
            }),
        );
        let router = router_with(client);

        router
            .execute_on("node-b", "create_entity", json!({}), "u1")
            .await
            .unwrap();

        assert_eq!(router.ledger().total("u1").await, 42);
    }

    #[tokio::test]
    async fn test_fan_out_partial_failure() {
        let client = Arc::new(MockNodeClient::new());
        client.push_outcome(
            "node-a",
            Err(RoutingError::Timeout {
                node: "node-a".to_string(),
                seconds: 15,
            }),
        );
        let router = router_with(client);

        let results = router
            .execute_on_all("health_check", json!({}), true, None, "u1")
            .await;

        assert_eq!(results.len(), 2);
        assert!(!results["node-a"].success);
        assert!(results["node-b"].success);
    }

    #[tokio::test]
    async fn test_session_pinning_round_trip() {
        let router = router_with(Arc::new(MockNodeClient::new()));

        assert_eq!(router.pinned_node("s1").await, None);
        router.pin_session("s1", "node-b").await;
        assert_eq!(router.pinned_node("s1").await.as_deref(), Some("node-b"));
        router.clear_pin("s1").await;
        assert_eq!(router.pinned_node("s1").await, None);
    }
}
