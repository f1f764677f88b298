//! Action Catalog
//!
//! Registry of action templates: built-ins matched by trigger keywords,
//! plus dynamically synthesized "create <Entity>" templates matched by
//! classified intent. The registry is rebuilt wholesale on discovery
//! refresh, never accumulated, so a refresh is idempotent and safe to
//! re-run per request.

pub mod builtin;
pub mod discovery;

use serde::{Deserialize, Serialize};

use crate::intent::{Intent, IntentAnalysis};

pub use discovery::SchemaProvider;

/// Value type of an action field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    #[default]
    Text,
    Number,
    Boolean,
    Date,
    Array,
    Object,
}

/// Relationship target for fields that identify another entity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelationshipSpec {
    /// Entity class the field points at
    pub target_class: String,
    /// Node that owns the target class, when not local
    #[serde(default)]
    pub source_node: Option<String>,
    /// Whether an unresolved name may be created as a new record
    #[serde(default)]
    pub autonomous_create: bool,
    /// Default field for substring search
    #[serde(default = "default_search_field")]
    pub search_field: String,
}

fn default_search_field() -> String {
    "name".to_string()
}

/// Schema for one action field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    /// Relationship flag + target, when the field identifies another entity
    #[serde(default)]
    pub relationship: Option<RelationshipSpec>,
    /// Alternative-field group: all members jointly substitute for this field
    #[serde(default)]
    pub alternatives: Vec<String>,
    /// Item sub-schema for array-typed fields
    #[serde(default)]
    pub item_schema: Vec<FieldSpec>,
}

impl FieldSpec {
    pub fn required_text(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type: FieldType::Text,
            required: true,
            description: description.to_string(),
            relationship: None,
            alternatives: Vec::new(),
            item_schema: Vec::new(),
        }
    }

    pub fn optional_text(name: &str, description: &str) -> Self {
        Self {
            required: false,
            ..Self::required_text(name, description)
        }
    }
}

/// One registered action template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefinition {
    pub id: String,
    pub label: String,
    pub description: String,
    /// Keyword triggers; empty for intent-matched templates
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    /// Executor id this action dispatches to
    pub executor: String,
    /// Entity class reference; may be a composite `node:Class` identifier
    #[serde(default)]
    pub entity_class: Option<String>,
    /// Owning node for remotely-discovered templates
    #[serde(default)]
    pub remote_node: Option<String>,
    /// Matched by NewRequest/NewWorkflow intent instead of keywords
    #[serde(default)]
    pub match_by_intent: bool,
}

impl ActionDefinition {
    pub fn required_field_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.clone())
            .collect()
    }

    /// Stateless actions with no required fields may execute without a
    /// filled pending action (copy/regenerate category).
    pub fn is_schema_free(&self) -> bool {
        self.fields.iter().all(|f| !f.required)
    }

    /// Base entity name with any `node:` prefix stripped, lowercased.
    pub fn entity_base_name(&self) -> Option<String> {
        self.entity_class.as_ref().map(|class| {
            class
                .rsplit(':')
                .next()
                .unwrap_or(class)
                .to_lowercase()
        })
    }
}

/// A ranked catalog match
#[derive(Debug, Clone)]
pub struct ActionMatch<'a> {
    pub definition: &'a ActionDefinition,
    pub score: f64,
}

/// The action template registry
pub struct ActionCatalog {
    builtins: Vec<ActionDefinition>,
    discovered: Vec<ActionDefinition>,
    intent_match_threshold: f64,
}

impl ActionCatalog {
    /// Catalog with the built-in templates and no discovered entries.
    pub fn new(intent_match_threshold: f64) -> Self {
        Self {
            builtins: builtin::builtin_actions(),
            discovered: Vec::new(),
            intent_match_threshold,
        }
    }

    /// Replace the discovered set wholesale. Registration order within a
    /// cycle is preserved; ties in ranking fall through to it.
    pub fn set_discovered(&mut self, actions: Vec<ActionDefinition>) {
        self.discovered = actions;
    }

    pub fn get(&self, id: &str) -> Option<&ActionDefinition> {
        self.definitions().find(|d| d.id == id)
    }

    pub fn definitions(&self) -> impl Iterator<Item = &ActionDefinition> {
        self.builtins.iter().chain(self.discovered.iter())
    }

    /// Compact candidate summaries for classifier prompts.
    pub fn candidate_summaries(&self) -> Vec<String> {
        self.definitions()
            .map(|d| format!("{}: {}", d.id, d.description))
            .collect()
    }

    /// Rank the templates that match this turn.
    ///
    /// An explicit `suggested_action_id` wins outright. Otherwise
    /// keyword-triggered templates score on trigger proximity and
    /// intent-matched templates score on classification confidence;
    /// a literal entity-name mention breaks ties. The sort is stable,
    /// so equal scores keep registration order.
    pub fn match_ranked<'a>(&'a self, message: &str, analysis: &IntentAnalysis) -> Vec<ActionMatch<'a>> {
        if let Some(suggested) = &analysis.suggested_action_id {
            if let Some(definition) = self.get(suggested) {
                return vec![ActionMatch {
                    definition,
                    score: 1.0,
                }];
            }
        }

        let message_lower = message.to_lowercase();
        let mut matches: Vec<ActionMatch<'a>> = Vec::new();

        for definition in self.definitions() {
            let score = if definition.match_by_intent {
                self.intent_score(definition, &message_lower, analysis)
            } else {
                keyword_score(&definition.triggers, &message_lower)
            };

            if let Some(score) = score {
                matches.push(ActionMatch { definition, score });
            }
        }

        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches
    }

    fn intent_score(
        &self,
        definition: &ActionDefinition,
        message_lower: &str,
        analysis: &IntentAnalysis,
    ) -> Option<f64> {
        // Keyword triggers are unreliable across arbitrary entity names,
        // so dynamic templates require a confident creation intent.
        if !matches!(analysis.intent, Intent::NewRequest | Intent::NewWorkflow) {
            return None;
        }
        if analysis.confidence < self.intent_match_threshold {
            return None;
        }

        let mut score = analysis.confidence;
        if let Some(name) = definition.entity_base_name() {
            if message_lower.contains(&name) {
                score += 0.05;
            }
        }
        Some(score.min(0.99))
    }
}

/// Score a keyword-triggered template against the raw message.
///
/// Exact trigger containment scores highest; a close Jaro-Winkler match
/// on a single word catches minor misspellings.
fn keyword_score(triggers: &[String], message_lower: &str) -> Option<f64> {
    let mut hits = 0usize;
    let mut fuzzy_hit = false;

    for trigger in triggers {
        let trigger_lower = trigger.to_lowercase();
        if message_lower.contains(&trigger_lower) {
            hits += 1;
        } else if !trigger_lower.contains(' ') {
            let close = message_lower
                .split_whitespace()
                .any(|word| strsim::jaro_winkler(word, &trigger_lower) >= 0.93);
            if close {
                fuzzy_hit = true;
            }
        }
    }

    if hits > 0 {
        Some((0.7 + 0.05 * (hits.saturating_sub(1)) as f64).min(0.95))
    } else if fuzzy_hit {
        Some(0.6)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{Intent, IntentAnalysis};

    fn analysis(intent: Intent, confidence: f64) -> IntentAnalysis {
        IntentAnalysis {
            intent,
            confidence,
            ..IntentAnalysis::default()
        }
    }

    fn create_template(id: &str, class: &str) -> ActionDefinition {
        ActionDefinition {
            id: id.to_string(),
            label: format!("Create {}", class),
            description: format!("Create a new {}", class),
            triggers: Vec::new(),
            fields: vec![FieldSpec::required_text("name", "Name")],
            executor: "create_entity".to_string(),
            entity_class: Some(class.to_string()),
            remote_node: None,
            match_by_intent: true,
        }
    }

    #[test]
    fn test_builtin_keyword_match() {
        let catalog = ActionCatalog::new(0.8);
        let ranked = catalog.match_ranked(
            "please reply to that email",
            &analysis(Intent::NewRequest, 0.5),
        );
        assert!(!ranked.is_empty());
        assert_eq!(ranked[0].definition.id, "reply_message");
    }

    #[test]
    fn test_intent_matched_template_requires_confidence() {
        let mut catalog = ActionCatalog::new(0.8);
        catalog.set_discovered(vec![create_template("create_invoice", "Invoice")]);

        let weak = catalog.match_ranked("create invoice", &analysis(Intent::NewWorkflow, 0.5));
        assert!(weak.iter().all(|m| m.definition.id != "create_invoice"));

        let strong = catalog.match_ranked("create invoice", &analysis(Intent::NewWorkflow, 0.9));
        assert_eq!(strong[0].definition.id, "create_invoice");
    }

    #[test]
    fn test_suggested_action_wins_outright() {
        let mut catalog = ActionCatalog::new(0.8);
        catalog.set_discovered(vec![create_template("create_invoice", "Invoice")]);

        let mut hint = analysis(Intent::ProvideData, 0.4);
        hint.suggested_action_id = Some("create_invoice".to_string());

        let ranked = catalog.match_ranked("anything at all", &hint);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].definition.id, "create_invoice");
        assert_eq!(ranked[0].score, 1.0);
    }

    #[test]
    fn test_entity_name_mention_breaks_tie() {
        let mut catalog = ActionCatalog::new(0.8);
        catalog.set_discovered(vec![
            create_template("create_order", "Order"),
            create_template("create_invoice", "Invoice"),
        ]);

        let ranked = catalog.match_ranked(
            "make me a new invoice",
            &analysis(Intent::NewWorkflow, 0.9),
        );
        assert_eq!(ranked[0].definition.id, "create_invoice");
    }

    #[test]
    fn test_equal_rank_keeps_registration_order() {
        let mut catalog = ActionCatalog::new(0.8);
        catalog.set_discovered(vec![
            create_template("create_alpha", "Alpha"),
            create_template("create_beta", "Beta"),
        ]);

        let ranked = catalog.match_ranked("make a new record", &analysis(Intent::NewWorkflow, 0.9));
        let ids: Vec<_> = ranked.iter().map(|m| m.definition.id.as_str()).collect();
        let alpha = ids.iter().position(|id| *id == "create_alpha").unwrap();
        let beta = ids.iter().position(|id| *id == "create_beta").unwrap();
        assert!(alpha < beta);
    }

    #[test]
    fn test_refresh_is_idempotent() {
        let mut catalog = ActionCatalog::new(0.8);
        let discovered = vec![create_template("create_invoice", "Invoice")];
        catalog.set_discovered(discovered.clone());
        catalog.set_discovered(discovered);

        let count = catalog
            .definitions()
            .filter(|d| d.id == "create_invoice")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_composite_entity_base_name() {
        let mut def = create_template("create_invoice", "Invoice");
        def.entity_class = Some("nodeA:Invoice".to_string());
        assert_eq!(def.entity_base_name().as_deref(), Some("invoice"));
    }
}
