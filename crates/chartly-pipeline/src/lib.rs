// SPDX-License-Identifier: MIT OR Apache-2.0
//! The Chartly record pipeline.
//!
//! Raw JSON from heterogeneous public APIs is normalized in stages: shape
//! detection splits the payload into candidate records, path mapping moves
//! source fields onto canonical destinations, enrichment fills derived
//! dimensions and coerces measures, and finalization stamps each record
//! with its content-addressed `record_id`.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod enrich;
mod mapping;
mod profile;
mod shape;

pub use enrich::{coerce_measures, fill_time_dims, inject_crypto_dims};
pub use mapping::{apply_mapping, get_path, set_nested_value};
pub use profile::{LimitsSpec, ProfileContent, ProfileError, ScheduleSpec, SourceSpec};
pub use shape::detect_records;

use serde_json::Value;
use tracing::debug;

/// Errors from running the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The record could not be serialized while computing its id.
    #[error("failed to serialize record: {0}")]
    Json(#[from] serde_json::Error),
}

/// Run the full pipeline over a raw payload.
///
/// Returns one finalized record per detected input record. Mapping misses
/// are silent (the destination field is simply absent); enrichment never
/// overwrites values that are already present.
///
/// # Errors
///
/// Returns [`PipelineError::Json`] if a record cannot be serialized while
/// computing its `record_id`.
pub fn run(
    profile_id: &str,
    content: &ProfileContent,
    raw: &Value,
) -> Result<Vec<Value>, PipelineError> {
    let candidates = detect_records(raw);
    debug!(profile_id, records = candidates.len(), "detected records");

    let mut out = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let mut record = apply_mapping(&candidate, &content.mapping);
        inject_crypto_dims(&mut record, profile_id);
        coerce_measures(&mut record);
        fill_time_dims(&mut record);
        finalize_record_id(&mut record)?;
        out.push(record);
    }
    Ok(out)
}

/// Stamp `record_id = "sha256:" + hex(sha256(compact_json + "\n"))` onto the
/// record, hashing a deep clone with any existing `record_id` removed.
///
/// # Errors
///
/// Returns [`PipelineError::Json`] if the record cannot be serialized.
pub fn finalize_record_id(record: &mut Value) -> Result<(), PipelineError> {
    let mut hashed = record.clone();
    if let Value::Object(map) = &mut hashed {
        map.remove("record_id");
    }
    // The digest input is the compact document plus a trailing newline.
    let mut compact = serde_json::to_string(&hashed)?;
    compact.push('\n');
    let id = format!("sha256:{}", chartly_canonical::sha256_hex(compact.as_bytes()));
    if let Value::Object(map) = record {
        map.insert("record_id".to_string(), Value::String(id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn content_with_mapping(pairs: &[(&str, &str)]) -> ProfileContent {
        let mapping: BTreeMap<String, String> = pairs
            .iter()
            .map(|(s, d)| ((*s).to_string(), (*d).to_string()))
            .collect();
        ProfileContent {
            id: "p".into(),
            name: "p".into(),
            version: "1".into(),
            source: SourceSpec {
                source_type: "http_rest".into(),
                url: "https://api.example.com".into(),
                auth: Some("none".into()),
            },
            mapping,
            schedule: None,
            limits: None,
        }
    }

    #[test]
    fn crypto_live_mapping_end_to_end() {
        // Scenario: a keyed crypto price map with a live profile.
        let raw = json!({"bitcoin": {"usd": 100.5, "last_updated_at": 1_700_000_000}});
        let content = content_with_mapping(&[
            ("crypto_id", "dims.crypto_id"),
            ("last_updated_at", "dims.time.timestamp"),
            ("usd", "measures.price_usd"),
        ]);

        let records = run("crypto-bitcoin-live", &content, &raw).unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r["dims"]["crypto_id"], "bitcoin");
        assert_eq!(r["dims"]["time"]["timestamp"], 1_700_000_000);
        assert_eq!(r["dims"]["timeframe"], "live");
        assert_eq!(r["measures"]["price_usd"], 100.5);
        let id = r["record_id"].as_str().unwrap();
        assert!(id.starts_with("sha256:"));
        assert_eq!(id.len(), "sha256:".len() + 64);
    }

    #[test]
    fn census_rows_pass_through_without_coercion() {
        // Header-row payload with an empty mapping: records pass through,
        // and POP stays a string because it is not under measures.
        let raw = json!([["NAME", "POP"], ["CA", "39538223"]]);
        let content = content_with_mapping(&[]);

        let records = run("census-population", &content, &raw).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["NAME"], "CA");
        assert_eq!(records[0]["POP"], "39538223");
        assert!(records[0]["POP"].is_string());
        assert!(records[0]["record_id"].as_str().unwrap().starts_with("sha256:"));
    }

    #[test]
    fn record_id_is_stable_and_excluded_from_hash() {
        let raw = json!({"results": [{"a": 1, "b": "x"}]});
        let content = content_with_mapping(&[]);

        let first = run("p", &content, &raw).unwrap();
        let second = run("p", &content, &raw).unwrap();
        assert_eq!(first[0]["record_id"], second[0]["record_id"]);

        // Re-finalizing a record that already carries its id must not drift.
        let mut again = first[0].clone();
        finalize_record_id(&mut again).unwrap();
        assert_eq!(again["record_id"], first[0]["record_id"]);
    }

    #[test]
    fn record_id_changes_with_content() {
        let content = content_with_mapping(&[]);
        let a = run("p", &content, &json!({"results": [{"v": 1}]})).unwrap();
        let b = run("p", &content, &json!({"results": [{"v": 2}]})).unwrap();
        assert_ne!(a[0]["record_id"], b[0]["record_id"]);
    }

    #[test]
    fn enrichment_runs_after_mapping() {
        // occurred_at mapped into dims.time feeds the date/year/month fill.
        let raw = json!({"results": [{"ts": "2023-11-14T22:13:20Z", "value": "12.5"}]});
        let content = content_with_mapping(&[
            ("ts", "dims.time.occurred_at"),
            ("value", "measures.level"),
        ]);
        let records = run("water-levels", &content, &raw).unwrap();
        let r = &records[0];
        assert_eq!(r["dims"]["time"]["date"], "2023-11-14");
        assert_eq!(r["dims"]["time"]["year"], 2023);
        assert_eq!(r["dims"]["time"]["month"], 11);
        assert_eq!(r["measures"]["level"], 12.5);
    }
}
