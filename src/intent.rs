//! Intent Classifier
//!
//! Classifies a conversational turn relative to any pending action.
//! A fixed table of exact-match phrases handles the common short turns
//! (affirmations, negations, greetings) deterministically; everything
//! else goes to the text-generation collaborator with a strict-JSON
//! prompt. The classifier is infallible from the caller's perspective:
//! any provider or parse failure degrades to a low-confidence Question.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::ExtractionError;
use crate::llm::{parse_lenient_json, LlmClient};
use crate::pending::PendingAction;

/// Closed set of things a message can be doing relative to the
/// conversation. Downstream dispatch switches on this exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Confirm,
    Reject,
    Modify,
    ProvideData,
    UseSuggestions,
    #[default]
    Question,
    Retrieval,
    NewRequest,
    NewWorkflow,
    Greeting,
    ComplexTask,
}

/// Result of classifying one turn. Never persisted beyond the turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntentAnalysis {
    pub intent: Intent,
    pub confidence: f64,
    #[serde(default)]
    pub extracted_data: Map<String, Value>,
    #[serde(default)]
    pub context_enhancement: String,
    #[serde(default)]
    pub suggested_action_id: Option<String>,
    #[serde(default)]
    pub modification_target: Option<String>,
}

impl IntentAnalysis {
    fn fallback() -> Self {
        Self {
            intent: Intent::Question,
            confidence: 0.2,
            ..Self::default()
        }
    }
}

const AFFIRMATIONS: &[&str] = &[
    "yes", "yes please", "yep", "yeah", "ok", "okay", "sure", "confirm", "do it", "go ahead",
    "sounds good", "correct",
];

const NEGATIONS: &[&str] = &[
    "no", "nope", "cancel", "stop", "never mind", "nevermind", "forget it", "don't", "do not",
    "abort",
];

const GREETINGS: &[&str] = &[
    "hi", "hello", "hey", "good morning", "good afternoon", "good evening", "howdy",
];

/// The intent classifier
pub struct IntentClassifier {
    llm: Arc<dyn LlmClient>,
}

impl IntentClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Classify a turn. `candidates` are catalog summaries used only
    /// when no action is pending.
    pub async fn classify(
        &self,
        message: &str,
        pending: Option<&PendingAction>,
        candidates: &[String],
    ) -> IntentAnalysis {
        if let Some(analysis) = fast_path(message) {
            debug!(intent = ?analysis.intent, "fast-path classification");
            return analysis;
        }

        let system = self.system_prompt(pending);
        let user = self.user_prompt(message, pending, candidates);

        let raw = match self.llm.chat_json(&system, &user).await {
            Ok(reply) => reply.content,
            Err(err) => {
                warn!(error = %err, "classifier provider call failed, degrading to fallback");
                return IntentAnalysis::fallback();
            }
        };

        let mut analysis = match parse_lenient_json(&raw)
            .map_err(|e| e.to_string())
            .and_then(|v| serde_json::from_value::<IntentAnalysis>(v).map_err(|e| e.to_string()))
        {
            Ok(analysis) => analysis,
            Err(message) => {
                let err = ExtractionError::Parse { message };
                warn!(error = %err, "classifier returned malformed JSON, degrading to fallback");
                return IntentAnalysis::fallback();
            }
        };

        analysis.confidence = analysis.confidence.clamp(0.0, 1.0);
        validate_extracted(&mut analysis, pending);
        analysis
    }

    fn system_prompt(&self, pending: Option<&PendingAction>) -> String {
        let state = if pending.is_some() {
            "The user has an action in progress; classify the message relative to it."
        } else {
            "No action is in progress."
        };
        format!(
            "You classify a chat message into one intent. {state}\n\
             Respond with a single JSON object: {{\"intent\": one of \
             [confirm, reject, modify, provide_data, use_suggestions, question, \
             retrieval, new_request, new_workflow, greeting, complex_task], \
             \"confidence\": 0.0-1.0, \"extracted_data\": {{field: value}}, \
             \"context_enhancement\": string, \"suggested_action_id\": string or null, \
             \"modification_target\": string or null}}."
        )
    }

    fn user_prompt(
        &self,
        message: &str,
        pending: Option<&PendingAction>,
        candidates: &[String],
    ) -> String {
        let mut prompt = format!("Message: {}\n", message);

        if let Some(action) = pending {
            prompt.push_str(&format!(
                "\nPending action: {}\nCurrent params: {}\nMissing fields: {}\n\
                 Only keys from the missing-field list are valid in extracted_data.\n",
                action.label,
                Value::Object(action.params.clone()),
                action.missing_fields.join(", "),
            ));
        } else if !candidates.is_empty() {
            let relevant = relevance_filter(message, candidates, 8);
            prompt.push_str("\nAvailable actions:\n");
            for summary in relevant {
                prompt.push_str(&format!("- {}\n", summary));
            }
        }

        prompt
    }
}

/// Deterministic classification for short fixed phrases.
fn fast_path(message: &str) -> Option<IntentAnalysis> {
    let normalized = message
        .trim()
        .trim_end_matches(['!', '.', '?'])
        .to_lowercase();

    let intent = if AFFIRMATIONS.contains(&normalized.as_str()) {
        Intent::Confirm
    } else if NEGATIONS.contains(&normalized.as_str()) {
        Intent::Reject
    } else if GREETINGS.contains(&normalized.as_str()) {
        Intent::Greeting
    } else {
        return None;
    };

    Some(IntentAnalysis {
        intent,
        confidence: 1.0,
        ..IntentAnalysis::default()
    })
}

/// Keep the candidate summaries that share a word with the message, up
/// to `cap`; when nothing overlaps, the first `cap` are sent instead.
fn relevance_filter<'a>(message: &str, candidates: &'a [String], cap: usize) -> Vec<&'a String> {
    let words: Vec<String> = message
        .to_lowercase()
        .split_whitespace()
        .filter(|w| w.len() > 2)
        .map(|w| w.to_string())
        .collect();

    let overlapping: Vec<&String> = candidates
        .iter()
        .filter(|summary| {
            let lower = summary.to_lowercase();
            words.iter().any(|w| lower.contains(w.as_str()))
        })
        .take(cap)
        .collect();

    if overlapping.is_empty() {
        candidates.iter().take(cap).collect()
    } else {
        overlapping
    }
}

/// Drop or remap extracted keys the model invented.
///
/// With a pending action that has missing fields, every extracted key
/// must belong to that set. When exactly one field is outstanding, an
/// unrecognized key is assumed to be the model's rename of it and is
/// remapped; otherwise it is dropped.
fn validate_extracted(analysis: &mut IntentAnalysis, pending: Option<&PendingAction>) {
    let Some(action) = pending else {
        return;
    };
    if action.missing_fields.is_empty() || analysis.extracted_data.is_empty() {
        return;
    }

    let missing: Vec<&str> = action.missing_fields.iter().map(String::as_str).collect();
    let mut cleaned: Map<String, Value> = Map::new();
    let mut unrecognized: HashMap<String, Value> = HashMap::new();

    for (key, value) in std::mem::take(&mut analysis.extracted_data) {
        if missing.contains(&key.as_str()) {
            cleaned.insert(key, value);
        } else {
            unrecognized.insert(key, value);
        }
    }

    if missing.len() == 1 && cleaned.is_empty() && unrecognized.len() == 1 {
        // Single outstanding field: best-effort remap of the one
        // unrecognized key onto it.
        if let Some((invented, value)) = unrecognized.into_iter().next() {
            debug!(from = %invented, to = %missing[0], "remapped hallucinated field");
            cleaned.insert(missing[0].to_string(), value);
        }
    } else {
        for key in unrecognized.keys() {
            warn!(field = %key, "dropped hallucinated field");
        }
    }

    analysis.extracted_data = cleaned;
}
