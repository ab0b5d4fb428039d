//! Parsing and reassembly of multi-part inference entries.
//!
//! The `entries` form field is a JSON object whose top-level keys are task
//! names (e.g. `facial_recognition`) and whose inner keys are type names
//! (e.g. `image`, or a sub-model variant like clip's `textual`). Entries
//! are flattened in declaration order, grouped by type for routing, and
//! merged back in the original order after fan-out. serde_json is built
//! with `preserve_order`, so iteration over the decoded object follows the
//! raw payload text.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::error::ProxyError;

/// One flattened inference entry.
#[derive(Debug, Clone)]
pub struct Entry {
    pub task: String,
    pub ty: String,
    pub payload: Value,
    /// Position in the request's declaration order.
    pub original_index: usize,
}

/// All entries sharing one type; the routing and concurrency unit.
///
/// Grouping is by type, not by task: two tasks routed through the same
/// backend type are merged into one outbound call.
#[derive(Debug, Clone)]
pub struct TypeGroup {
    pub ty: String,
    pub entries: Vec<Entry>,
}

/// Decodes the raw `entries` field into a flat, order-preserving list.
pub fn parse_entries(raw: &str) -> Result<Vec<Entry>, ProxyError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| ProxyError::MalformedEntries(e.to_string()))?;
    let top = value
        .as_object()
        .ok_or_else(|| ProxyError::MalformedEntries("entries must be a JSON object".into()))?;

    let mut entries = Vec::new();
    for (task, types) in top {
        let types = types.as_object().ok_or_else(|| {
            ProxyError::MalformedEntries(format!("invalid types structure for task: {task}"))
        })?;
        for (ty, payload) in types {
            entries.push(Entry {
                task: task.clone(),
                ty: ty.clone(),
                payload: payload.clone(),
                original_index: entries.len(),
            });
        }
    }
    Ok(entries)
}

/// Groups entries by type, groups ordered by first appearance.
pub fn group_by_type(entries: &[Entry]) -> Vec<TypeGroup> {
    let mut groups: Vec<TypeGroup> = Vec::new();
    for entry in entries {
        match groups.iter_mut().find(|g| g.ty == entry.ty) {
            Some(group) => group.entries.push(entry.clone()),
            None => groups.push(TypeGroup {
                ty: entry.ty.clone(),
                entries: vec![entry.clone()],
            }),
        }
    }
    groups
}

/// Re-nests one group's entries back into the `{task: {type: payload}}`
/// shape expected by backends.
pub fn entries_for_type(entries: &[Entry]) -> Value {
    let mut top = Map::new();
    for entry in entries {
        let types = top
            .entry(entry.task.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(types) = types.as_object_mut() {
            types.insert(entry.ty.clone(), entry.payload.clone());
        }
    }
    Value::Object(top)
}

/// Merges per-type results back into a single response object.
///
/// Walks the original entry order and merges each entry's type result,
/// last-write-wins when two entries of different tasks collide on a key.
/// Callers only invoke this once every type group succeeded.
pub fn merge_results(
    entries: &[Entry],
    results: &HashMap<String, Map<String, Value>>,
) -> Map<String, Value> {
    let mut merged = Map::new();
    for entry in entries {
        if let Some(result) = results.get(&entry.ty) {
            for (key, value) in result {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ========== Parsing ==========

    #[test]
    fn test_parse_single_entry() {
        let entries = parse_entries(r#"{"facial_recognition":{"image":{}}}"#).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].task, "facial_recognition");
        assert_eq!(entries[0].ty, "image");
        assert_eq!(entries[0].payload, json!({}));
        assert_eq!(entries[0].original_index, 0);
    }

    #[test]
    fn test_parse_preserves_declaration_order() {
        let raw = r#"{"clip":{"visual":{"modelName":"b"},"textual":{"modelName":"a"}},"facial_recognition":{"image":{}}}"#;
        let entries = parse_entries(raw).unwrap();
        let keys: Vec<(&str, &str, usize)> = entries
            .iter()
            .map(|e| (e.task.as_str(), e.ty.as_str(), e.original_index))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("clip", "visual", 0),
                ("clip", "textual", 1),
                ("facial_recognition", "image", 2),
            ]
        );
    }

    #[test]
    fn test_parse_payload_forwarded_unmodified() {
        let raw = r#"{"clip":{"textual":{"modelName":"ViT-B-32","options":{"k":3}}}}"#;
        let entries = parse_entries(raw).unwrap();
        assert_eq!(
            entries[0].payload,
            json!({"modelName": "ViT-B-32", "options": {"k": 3}})
        );
    }

    #[test]
    fn test_parse_rejects_non_object_top_level() {
        assert!(matches!(
            parse_entries(r#"["image"]"#),
            Err(ProxyError::MalformedEntries(_))
        ));
        assert!(matches!(
            parse_entries("42"),
            Err(ProxyError::MalformedEntries(_))
        ));
    }

    #[test]
    fn test_parse_rejects_non_object_task_value() {
        let err = parse_entries(r#"{"facial_recognition":"image"}"#).unwrap_err();
        match err {
            ProxyError::MalformedEntries(msg) => assert!(msg.contains("facial_recognition")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        assert!(matches!(
            parse_entries("{not json"),
            Err(ProxyError::MalformedEntries(_))
        ));
    }

    #[test]
    fn test_parse_empty_object_yields_no_entries() {
        assert!(parse_entries("{}").unwrap().is_empty());
    }

    // ========== Grouping ==========

    #[test]
    fn test_group_by_type_merges_across_tasks() {
        let raw = r#"{"facial_recognition":{"image":{}},"object_detection":{"image":{"k":1}},"clip":{"textual":{}}}"#;
        let entries = parse_entries(raw).unwrap();
        let groups = group_by_type(&entries);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].ty, "image");
        assert_eq!(groups[0].entries.len(), 2);
        assert_eq!(groups[1].ty, "textual");
        assert_eq!(groups[1].entries.len(), 1);
    }

    #[test]
    fn test_group_order_follows_first_appearance() {
        let raw = r#"{"clip":{"textual":{},"visual":{}},"facial_recognition":{"image":{}}}"#;
        let entries = parse_entries(raw).unwrap();
        let groups = group_by_type(&entries);
        let types: Vec<&str> = groups.iter().map(|g| g.ty.as_str()).collect();
        assert_eq!(types, vec!["textual", "visual", "image"]);
    }

    // ========== Re-nesting ==========

    #[test]
    fn test_entries_for_type_rebuilds_nested_shape() {
        let raw = r#"{"facial_recognition":{"image":{"min":0.7}},"object_detection":{"image":{}}}"#;
        let entries = parse_entries(raw).unwrap();
        let groups = group_by_type(&entries);

        let rebuilt = entries_for_type(&groups[0].entries);
        assert_eq!(
            rebuilt,
            json!({
                "facial_recognition": {"image": {"min": 0.7}},
                "object_detection": {"image": {}}
            })
        );
    }

    #[test]
    fn test_entries_for_type_subset_only() {
        let raw = r#"{"facial_recognition":{"image":{}},"clip":{"textual":{}}}"#;
        let entries = parse_entries(raw).unwrap();
        let groups = group_by_type(&entries);

        let image_group = entries_for_type(&groups[0].entries);
        assert_eq!(image_group, json!({"facial_recognition": {"image": {}}}));
    }

    // ========== Merging ==========

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn test_merge_single_type() {
        let entries = parse_entries(r#"{"facial_recognition":{"image":{}}}"#).unwrap();
        let mut results = HashMap::new();
        results.insert("image".to_string(), obj(json!({"image": {"box": [1, 2, 3, 4]}})));

        let merged = merge_results(&entries, &results);
        assert_eq!(Value::Object(merged), json!({"image": {"box": [1, 2, 3, 4]}}));
    }

    #[test]
    fn test_merge_unions_keys_across_types() {
        let raw = r#"{"facial_recognition":{"image":{}},"clip":{"textual":{}}}"#;
        let entries = parse_entries(raw).unwrap();
        let mut results = HashMap::new();
        results.insert("image".to_string(), obj(json!({"image": {"box": []}})));
        results.insert("textual".to_string(), obj(json!({"textual": [0.1, 0.2]})));

        let merged = merge_results(&entries, &results);
        assert_eq!(
            Value::Object(merged),
            json!({"image": {"box": []}, "textual": [0.1, 0.2]})
        );
    }

    #[test]
    fn test_merge_last_write_wins_on_collision() {
        let raw = r#"{"facial_recognition":{"image":{}},"object_detection":{"thumbnail":{}}}"#;
        let entries = parse_entries(raw).unwrap();
        let mut results = HashMap::new();
        results.insert("image".to_string(), obj(json!({"shared": "from-image"})));
        results.insert("thumbnail".to_string(), obj(json!({"shared": "from-thumbnail"})));

        let merged = merge_results(&entries, &results);
        // "thumbnail" appears later in the original order
        assert_eq!(merged.get("shared"), Some(&json!("from-thumbnail")));
    }

    #[test]
    fn test_merge_repeated_type_is_idempotent() {
        // two entries of the same type merge the same group result twice
        let raw = r#"{"facial_recognition":{"image":{}},"object_detection":{"image":{}}}"#;
        let entries = parse_entries(raw).unwrap();
        let mut results = HashMap::new();
        results.insert("image".to_string(), obj(json!({"image": {"n": 1}})));

        let merged = merge_results(&entries, &results);
        assert_eq!(merged.len(), 1);
        assert_eq!(Value::Object(merged), json!({"image": {"n": 1}}));
    }
}
