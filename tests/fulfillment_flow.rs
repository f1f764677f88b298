//! End-to-end conversation scenarios over mock collaborators.
//!
//! Drives the full pipeline: classification, catalog match, extraction
//! with relationship resolution, cross-turn pending state, confirm and
//! execute, and federated dispatch.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use actionflow::catalog::discovery::SchemaProvider;
use actionflow::error::StoreResult;
use actionflow::node::CollectionDescriptor;
use actionflow::{
    ConversationService, EngineConfig, EntityRecord, EntityStore, FieldSpec, FieldType, Intent,
    MemoryEntityStore, MemoryKvStore, MockLlmClient, MockNodeClient, NodeDescriptor,
    ProcessOptions, RelationshipSpec,
};

/// Invoice provider over the in-memory entity store.
struct InvoiceProvider {
    entities: Arc<MemoryEntityStore>,
}

#[async_trait]
impl SchemaProvider for InvoiceProvider {
    fn entity_class(&self) -> &str {
        "Invoice"
    }

    fn describe_fields(&self) -> Vec<FieldSpec> {
        vec![
            FieldSpec {
                name: "customer".to_string(),
                field_type: FieldType::Text,
                required: true,
                description: "Customer the invoice is for".to_string(),
                relationship: Some(RelationshipSpec {
                    target_class: "Customer".to_string(),
                    source_node: None,
                    autonomous_create: true,
                    search_field: "name".to_string(),
                }),
                alternatives: Vec::new(),
                item_schema: Vec::new(),
            },
            FieldSpec {
                name: "items".to_string(),
                field_type: FieldType::Array,
                required: true,
                description: "Line items".to_string(),
                relationship: None,
                alternatives: Vec::new(),
                item_schema: vec![
                    FieldSpec::required_text("name", "Item name"),
                    FieldSpec {
                        name: "price".to_string(),
                        field_type: FieldType::Number,
                        required: true,
                        description: "Unit price".to_string(),
                        relationship: None,
                        alternatives: Vec::new(),
                        item_schema: Vec::new(),
                    },
                ],
            },
        ]
    }

    async fn create_from_fields(
        &self,
        params: &Map<String, Value>,
        user_id: &str,
    ) -> StoreResult<EntityRecord> {
        self.entities.create("Invoice", params.clone(), user_id).await
    }
}

struct Fixture {
    service: ConversationService,
    llm: Arc<MockLlmClient>,
    entities: Arc<MemoryEntityStore>,
    node_client: Arc<MockNodeClient>,
}

async fn fixture() -> Fixture {
    actionflow::init_tracing();
    let llm = Arc::new(MockLlmClient::new());
    let entities = MemoryEntityStore::shared();
    let node_client = Arc::new(MockNodeClient::new());
    node_client.set_collections(
        "node-b",
        vec![CollectionDescriptor {
            entity_class: "Shipment".to_string(),
            methods: vec!["create".to_string()],
            fields: vec![FieldSpec::required_text("destination", "Where to ship")],
        }],
    );

    let service = ConversationService::builder(EngineConfig::default())
        .llm(llm.clone())
        .kv(MemoryKvStore::shared())
        .entity_store(entities.clone())
        .entity_search(entities.clone())
        .node_client(node_client.clone())
        .node(NodeDescriptor {
            slug: "node-b".to_string(),
            base_url: "https://node-b.example.com/".to_string(),
            token: "secret".to_string(),
        })
        .provider(Arc::new(InvoiceProvider {
            entities: entities.clone(),
        }))
        .build()
        .unwrap();

    service.refresh_catalog().await;

    Fixture {
        service,
        llm,
        entities,
        node_client,
    }
}

fn classification(intent: &str, confidence: f64) -> String {
    json!({
        "intent": intent,
        "confidence": confidence,
        "extracted_data": {},
    })
    .to_string()
}

#[tokio::test]
async fn invoice_flow_from_first_mention_to_execution() {
    let fx = fixture().await;

    // Turn 1: "create invoice" matches the discovered template and
    // opens an incomplete pending action.
    fx.llm.push_text(classification("new_workflow", 0.9));
    fx.llm.push_tool(json!({})); // extraction finds no params yet

    let turn1 = fx
        .service
        .process("create an invoice", "s1", "u1", ProcessOptions::default())
        .await;

    let workflow = turn1.metadata.active_workflow.expect("workflow opened");
    assert_eq!(workflow.action_id, "create_invoice");
    assert_eq!(workflow.missing_fields, vec!["customer", "items"]);
    assert!(!workflow.ready_to_execute);
    assert_eq!(turn1.metadata.intent.unwrap().intent, Intent::NewWorkflow);

    // Turn 2: the follow-up supplies both fields; "John" is resolved by
    // search-or-create and the line items parse into the array form.
    fx.llm.push_text(classification("provide_data", 0.85));
    fx.llm.push_tool(json!({
        "customer": "John",
        "items": [{"name": "widget", "price": 5, "quantity": 2}],
    }));

    let turn2 = fx
        .service
        .process(
            "customer is John, 2 widgets at $5",
            "s1",
            "u1",
            ProcessOptions::default(),
        )
        .await;

    let workflow = turn2.metadata.active_workflow.expect("workflow still active");
    assert!(workflow.missing_fields.is_empty());
    assert!(workflow.ready_to_execute);
    assert!(turn2.content.contains("go ahead"));

    // The unresolved name became a Customer record.
    assert_eq!(fx.entities.count("Customer").await, 1);

    // Turn 3: "yes" executes, clears the pending entry.
    let turn3 = fx.service.process("yes", "s1", "u1", ProcessOptions::default()).await;

    assert!(turn3.success);
    let executed = turn3.metadata.executed.expect("executed result present");
    assert!(executed.success);
    assert!(turn3.metadata.active_workflow.is_none());
    assert_eq!(fx.entities.count("Invoice").await, 1);

    // Turn 4: a second "yes" finds nothing pending.
    let turn4 = fx.service.process("yes", "s1", "u1", ProcessOptions::default()).await;
    assert!(turn4.content.contains("nothing waiting"));
}

#[tokio::test]
async fn confirm_on_incomplete_action_lists_missing_fields() {
    let fx = fixture().await;

    fx.llm.push_text(classification("new_workflow", 0.9));
    fx.llm.push_tool(json!({}));
    fx.service
        .process("create an invoice", "s1", "u1", ProcessOptions::default())
        .await;

    // "yes" while customer and items are still missing must not execute.
    let turn = fx.service.process("yes", "s1", "u1", ProcessOptions::default()).await;

    assert!(turn.metadata.executed.is_none());
    assert!(turn.content.contains("customer"));
    assert!(turn.content.contains("items"));
    assert_eq!(fx.entities.count("Invoice").await, 0);
}

#[tokio::test]
async fn reject_cancels_the_pending_action() {
    let fx = fixture().await;

    fx.llm.push_text(classification("new_workflow", 0.9));
    fx.llm.push_tool(json!({}));
    fx.service
        .process("create an invoice", "s1", "u1", ProcessOptions::default())
        .await;

    let turn = fx
        .service
        .process("never mind", "s1", "u1", ProcessOptions::default())
        .await;
    assert!(turn.content.contains("dropped"));
    assert!(turn.metadata.active_workflow.is_none());

    // The next confirm has nothing to act on.
    let turn = fx.service.process("yes", "s1", "u1", ProcessOptions::default()).await;
    assert!(turn.content.contains("nothing waiting"));
}

#[tokio::test]
async fn remote_template_executes_on_owning_node() {
    let fx = fixture().await;

    fx.llm.push_text(classification("new_workflow", 0.9));
    fx.llm.push_tool(json!({"destination": "Oslo"}));

    let turn1 = fx
        .service
        .process("create a shipment to Oslo", "s2", "u1", ProcessOptions::default())
        .await;

    let workflow = turn1.metadata.active_workflow.expect("workflow opened");
    assert_eq!(workflow.action_id, "create_shipment");
    assert!(workflow.ready_to_execute);

    // The session is pinned to the owning node while the workflow runs.
    assert_eq!(
        fx.service.router().pinned_node("s2").await.as_deref(),
        Some("node-b")
    );

    let turn2 = fx.service.process("yes", "s2", "u1", ProcessOptions::default()).await;

    let executed = turn2.metadata.executed.expect("executed result present");
    assert!(executed.success);
    assert_eq!(executed.node.as_deref(), Some("node-b"));

    // The forwarded payload carries the marker and the stripped class.
    let calls = fx.node_client.recorded_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "node-b");
    assert_eq!(calls[0].2["entity_class"], "Shipment");
    assert_eq!(calls[0].2["forwarded"], true);

    // The pin is released once the workflow finishes.
    assert_eq!(fx.service.router().pinned_node("s2").await, None);
}

#[tokio::test]
async fn forwarded_request_is_never_forwarded_again() {
    let fx = fixture().await;

    fx.llm.push_text(classification("new_workflow", 0.9));
    fx.llm.push_tool(json!({"destination": "Oslo"}));
    fx.service
        .process("create a shipment to Oslo", "s3", "u1", ProcessOptions::default())
        .await;

    let options = ProcessOptions {
        already_forwarded: true,
        ..ProcessOptions::default()
    };
    let turn = fx.service.process("yes", "s3", "u1", options).await;

    // Every routing signal points at node-b, but the marker wins:
    // nothing left this node.
    assert!(fx.node_client.recorded_calls().is_empty());
    // Local handling has no Shipment provider, so the result is a
    // failed local execution, not a forwarded one.
    let executed = turn.metadata.executed.expect("executed result present");
    assert!(!executed.success);
    assert!(executed.node.is_none());
}

#[tokio::test]
async fn unrelated_new_request_supersedes_pending_action() {
    let fx = fixture().await;

    fx.llm.push_text(classification("new_workflow", 0.9));
    fx.llm.push_tool(json!({}));
    fx.service
        .process("create an invoice", "s4", "u1", ProcessOptions::default())
        .await;

    fx.llm.push_text(classification("new_workflow", 0.9));
    fx.llm.push_tool(json!({"destination": "Oslo"}));
    let turn = fx
        .service
        .process("actually, create a shipment to Oslo", "s4", "u1", ProcessOptions::default())
        .await;

    let workflow = turn.metadata.active_workflow.expect("workflow replaced");
    assert_eq!(workflow.action_id, "create_shipment");
}

#[tokio::test]
async fn keyword_builtin_still_matches_without_llm_confidence() {
    let fx = fixture().await;

    // Low-confidence classification: the dynamic templates stay out,
    // but the keyword-triggered builtin matches on the raw text.
    fx.llm.push_text(classification("new_request", 0.5));
    fx.llm.push_tool(json!({"title": "standup", "start_time": "tomorrow 9am"}));

    let turn = fx
        .service
        .process("schedule a standup tomorrow at 9", "s5", "u1", ProcessOptions::default())
        .await;

    let workflow = turn.metadata.active_workflow.expect("workflow opened");
    assert_eq!(workflow.action_id, "schedule_event");
    assert!(workflow.ready_to_execute);
}

#[tokio::test]
async fn pending_action_status_progression() {
    let fx = fixture().await;

    fx.llm.push_text(classification("new_workflow", 0.9));
    fx.llm.push_tool(json!({}));
    let turn = fx
        .service
        .process("create an invoice", "s6", "u1", ProcessOptions::default())
        .await;
    assert!(!turn.metadata.active_workflow.unwrap().ready_to_execute);

    fx.llm.push_text(classification("provide_data", 0.85));
    fx.llm.push_tool(json!({
        "customer": "Acme",
        "items": [{"name": "bolt", "price": 1}],
    }));
    let turn = fx
        .service
        .process("Acme, one bolt at 1", "s6", "u1", ProcessOptions::default())
        .await;
    assert!(turn.metadata.active_workflow.unwrap().ready_to_execute);
}
