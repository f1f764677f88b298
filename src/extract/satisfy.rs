//! Field-satisfaction algorithm
//!
//! Decides whether a field of an action schema is satisfied by the
//! current parameter map. Collaborator output is messy: arrays arrive
//! as literal arrays, numbered flat fields (`item_1_name`), or flat
//! top-level fields; relationships arrive as ids, nested objects, or
//! prefixed flat fields. All accepted forms are recognized here so the
//! rest of the engine can recompute `missing_fields` from one place.

use serde_json::{Map, Value};

use crate::catalog::{FieldSpec, FieldType};

/// A value counts as present when it carries information.
fn present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        _ => true,
    }
}

/// Singular form used by numbered flat fields (`items` -> `item_1_name`).
fn singular(name: &str) -> Option<&str> {
    name.strip_suffix('s').filter(|s| !s.is_empty())
}

/// True when `field` is satisfied by `params`.
pub fn is_satisfied(field: &FieldSpec, params: &Map<String, Value>) -> bool {
    // (a) direct key
    if params.get(&field.name).map(present).unwrap_or(false) {
        return true;
    }

    // (b) full alternative-field group
    if !field.alternatives.is_empty()
        && field
            .alternatives
            .iter()
            .all(|alt| params.get(alt).map(present).unwrap_or(false))
    {
        return true;
    }

    match field.field_type {
        FieldType::Array => array_satisfied(field, params),
        _ if field.relationship.is_some() => relationship_satisfied(field, params),
        _ => false,
    }
}

fn array_satisfied(field: &FieldSpec, params: &Map<String, Value>) -> bool {
    // Literal array with at least one complete item.
    if let Some(Value::Array(items)) = params.get(&field.name) {
        if items.iter().any(|item| item_complete(field, item)) {
            return true;
        }
    }

    // Numbered flat fields: item_1_name, item_2_price, ...
    if numbered_flat_satisfied(field, params) {
        return true;
    }

    // Flat top-level fields matching the item sub-schema.
    let required: Vec<&FieldSpec> = field.item_schema.iter().filter(|f| f.required).collect();
    !required.is_empty()
        && required
            .iter()
            .all(|sub| params.get(&sub.name).map(present).unwrap_or(false))
}

fn item_complete(field: &FieldSpec, item: &Value) -> bool {
    let required: Vec<&FieldSpec> = field.item_schema.iter().filter(|f| f.required).collect();
    if required.is_empty() {
        return present(item);
    }
    match item {
        Value::Object(map) => required
            .iter()
            .all(|sub| map.get(&sub.name).map(present).unwrap_or(false)),
        _ => false,
    }
}

fn numbered_flat_satisfied(field: &FieldSpec, params: &Map<String, Value>) -> bool {
    let mut prefixes = vec![field.name.as_str()];
    if let Some(s) = singular(&field.name) {
        prefixes.push(s);
    }

    let required: Vec<&str> = field
        .item_schema
        .iter()
        .filter(|f| f.required)
        .map(|f| f.name.as_str())
        .collect();
    if required.is_empty() {
        return false;
    }

    for prefix in prefixes {
        // Collect the indices that appear for this prefix.
        let mut indices: Vec<u32> = params
            .keys()
            .filter_map(|key| {
                let rest = key.strip_prefix(prefix)?.strip_prefix('_')?;
                let (index, _sub) = rest.split_once('_')?;
                index.parse().ok()
            })
            .collect();
        indices.sort_unstable();
        indices.dedup();

        for index in indices {
            let complete = required.iter().all(|sub| {
                let key = format!("{}_{}_{}", prefix, index, sub);
                params.get(&key).map(present).unwrap_or(false)
            });
            if complete {
                return true;
            }
        }
    }

    false
}

fn relationship_satisfied(field: &FieldSpec, params: &Map<String, Value>) -> bool {
    // Nested object under the field name is handled by the direct-key
    // check already; here the prefixed flat form remains:
    // customer_name, customer_email with at least one present.
    let prefix = format!("{}_", field.name);
    params
        .iter()
        .any(|(key, value)| key.starts_with(&prefix) && present(value))
}

/// Required fields of `schema` not satisfied by `params`, in schema
/// order. This is the single source of truth for `missing_fields`.
pub fn missing_required(schema: &[FieldSpec], params: &Map<String, Value>) -> Vec<String> {
    schema
        .iter()
        .filter(|field| field.required && !is_satisfied(field, params))
        .map(|field| field.name.clone())
        .collect()
}
