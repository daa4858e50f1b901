// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dotted-path mapping between source records and canonical records.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One step of a tokenized source path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Field(String),
    Index(usize),
}

/// Tokenize `a.b[0][1].c` into field and index steps.
fn tokenize(path: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    for segment in path.split('.') {
        let mut rest = segment;
        let field_end = rest.find('[').unwrap_or(rest.len());
        let field = &rest[..field_end];
        if !field.is_empty() {
            tokens.push(Token::Field(field.to_string()));
        }
        rest = &rest[field_end..];
        // Consecutive indexes: a[0][1]
        while let Some(open) = rest.find('[') {
            let Some(close) = rest[open..].find(']') else {
                break;
            };
            let inner = &rest[open + 1..open + close];
            if let Ok(index) = inner.parse::<usize>() {
                tokens.push(Token::Index(index));
            }
            rest = &rest[open + close + 1..];
        }
    }
    tokens
}

/// Fetch the value at a dotted source path, `None` when any step misses.
#[must_use]
pub fn get_path<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = record;
    for token in tokenize(path) {
        current = match token {
            Token::Field(name) => current.get(&name)?,
            Token::Index(index) => current.get(index)?,
        };
    }
    Some(current)
}

/// Set `value` at a dotted destination path, creating intermediate objects.
///
/// If an intermediate key exists and is not an object it is overwritten:
/// last write wins along the path.
pub fn set_nested_value(record: &mut Value, path: &str, value: Value) {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return;
    }
    let mut current = record;
    for segment in &segments[..segments.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Some(map) = current.as_object_mut() else {
            return;
        };
        current = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Some(map) = current.as_object_mut() {
        map.insert(segments[segments.len() - 1].to_string(), value);
    }
}

/// Apply a `src_path -> dst_path` mapping to one record.
///
/// Missing source paths are skipped silently. With an empty mapping, object
/// records pass through unchanged and scalar records are wrapped under a
/// `value` key so downstream stages always see an object.
#[must_use]
pub fn apply_mapping(record: &Value, mapping: &BTreeMap<String, String>) -> Value {
    if mapping.is_empty() {
        return match record {
            Value::Object(_) => record.clone(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                Value::Object(map)
            }
        };
    }

    let mut out = Value::Object(Map::new());
    for (src, dst) in mapping {
        if let Some(found) = get_path(record, src) {
            set_nested_value(&mut out, dst, found.clone());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tokenizes_fields_and_indexes() {
        assert_eq!(
            tokenize("a.b[0].c"),
            vec![
                Token::Field("a".into()),
                Token::Field("b".into()),
                Token::Index(0),
                Token::Field("c".into()),
            ]
        );
        assert_eq!(
            tokenize("rows[0][1]"),
            vec![Token::Field("rows".into()), Token::Index(0), Token::Index(1)]
        );
    }

    #[test]
    fn get_path_traverses_objects_and_arrays() {
        let record = json!({"a": {"b": [{"c": 42}, {"c": 43}]}});
        assert_eq!(get_path(&record, "a.b[1].c"), Some(&json!(43)));
        assert_eq!(get_path(&record, "a.b[9].c"), None);
        assert_eq!(get_path(&record, "a.missing"), None);
    }

    #[test]
    fn set_nested_creates_intermediates() {
        let mut record = json!({});
        set_nested_value(&mut record, "dims.time.timestamp", json!(1700000000));
        assert_eq!(record["dims"]["time"]["timestamp"], 1700000000);
    }

    #[test]
    fn set_nested_overwrites_non_object_intermediates() {
        let mut record = json!({"dims": "scalar"});
        set_nested_value(&mut record, "dims.crypto_id", json!("btc"));
        assert_eq!(record["dims"]["crypto_id"], "btc");
    }

    #[test]
    fn mapping_skips_missing_sources_silently() {
        let record = json!({"present": 1});
        let mapping = BTreeMap::from([
            ("present".to_string(), "out.here".to_string()),
            ("absent".to_string(), "out.gone".to_string()),
        ]);
        let mapped = apply_mapping(&record, &mapping);
        assert_eq!(mapped["out"]["here"], 1);
        assert!(mapped["out"].get("gone").is_none());
    }

    #[test]
    fn empty_mapping_passes_objects_through() {
        let record = json!({"keep": {"everything": true}});
        assert_eq!(apply_mapping(&record, &BTreeMap::new()), record);
    }

    #[test]
    fn empty_mapping_wraps_scalars() {
        let mapped = apply_mapping(&json!(7), &BTreeMap::new());
        assert_eq!(mapped, json!({"value": 7}));
    }
}
