//! Built-in action templates
//!
//! The fixed set of keyword-triggered actions every deployment carries,
//! defined as an embedded YAML document and parsed at catalog build
//! time. Dynamic entity-creation templates come from discovery instead.

use serde::Deserialize;

use super::ActionDefinition;

const BUILTIN_ACTIONS_YAML: &str = r#"
version: "1.0"
description: "Built-in action templates"
actions:
  - id: reply_message
    label: "Reply"
    description: "Reply to the message under discussion"
    executor: send_message
    triggers: ["reply", "respond", "write back", "answer him", "answer her", "answer them"]
    fields:
      - name: body
        type: text
        required: true
        description: "Reply body text"
      - name: recipient
        type: text
        description: "Override recipient address"

  - id: forward_message
    label: "Forward"
    description: "Forward the message under discussion to someone else"
    executor: send_message
    triggers: ["forward", "send this to", "pass this along", "pass along"]
    fields:
      - name: recipient
        type: text
        required: true
        description: "Address to forward to"
      - name: note
        type: text
        description: "Optional note to prepend"

  - id: schedule_event
    label: "Schedule event"
    description: "Schedule a calendar event"
    executor: build_event
    triggers: ["schedule", "set up a meeting", "book a meeting", "calendar", "appointment"]
    fields:
      - name: title
        type: text
        required: true
        description: "Event title"
      - name: start_time
        type: date
        required: true
        description: "When the event starts"
      - name: end_time
        type: date
        description: "When the event ends"
      - name: location
        type: text
        description: "Where the event takes place"
      - name: attendees
        type: array
        description: "People to invite"
        item_schema:
          - name: email
            type: text
            required: true
            description: "Attendee address"

  - id: create_task
    label: "Create task"
    description: "Create a task or reminder"
    executor: create_entity
    entity_class: Task
    triggers: ["task", "todo", "to-do", "remind me"]
    fields:
      - name: title
        type: text
        required: true
        description: "What needs doing"
      - name: due_date
        type: date
        description: "When it is due"
      - name: notes
        type: text
        description: "Extra detail"

  - id: summarize_text
    label: "Summarize"
    description: "Summarize the content under discussion"
    executor: generate_text
    triggers: ["summarize", "summarise", "tl;dr", "sum up", "give me the gist"]
    fields: []

  - id: translate_text
    label: "Translate"
    description: "Translate the content under discussion"
    executor: generate_text
    triggers: ["translate", "in french", "in german", "in spanish", "in english"]
    fields:
      - name: target_language
        type: text
        description: "Language to translate into"
"#;

#[derive(Debug, Deserialize)]
struct BuiltinCatalogDoc {
    #[allow(dead_code)]
    version: String,
    #[allow(dead_code)]
    description: String,
    actions: Vec<ActionDefinition>,
}

/// The built-in templates, in registration order.
pub fn builtin_actions() -> Vec<ActionDefinition> {
    let doc: BuiltinCatalogDoc =
        serde_yaml::from_str(BUILTIN_ACTIONS_YAML).expect("embedded builtin catalog is valid YAML");
    doc.actions
}
