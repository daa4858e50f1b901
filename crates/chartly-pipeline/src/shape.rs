// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shape detection: split arbitrary API payloads into candidate records.

use serde_json::{Map, Value};

/// Detect the payload shape and split it into candidate records.
///
/// Shapes are tried in a fixed order:
///
/// 1. Zipped market-chart maps: `{"prices": [[ts, v], ...], ...}`.
/// 2. Key-keyed maps of objects (e.g. a crypto price map).
/// 3. Parallel hourly arrays: `{"hourly": {"time": [...], "k": [...]}}`.
/// 4. Array-of-arrays with a string header row.
/// 5. A `results` array, or the value wrapped as a single record.
#[must_use]
pub fn detect_records(raw: &Value) -> Vec<Value> {
    if let Some(records) = zipped_market_chart(raw) {
        return records;
    }
    if let Some(records) = keyed_object_map(raw) {
        return records;
    }
    if let Some(records) = parallel_hourly_arrays(raw) {
        return records;
    }
    if let Some(records) = header_rows(raw) {
        return records;
    }
    if let Some(results) = raw.get("results").and_then(Value::as_array) {
        return results.clone();
    }
    vec![raw.clone()]
}

/// Shape 1: `{"prices": [[ts, v], ...], "market_caps": ..., "total_volumes": ...}`.
fn zipped_market_chart(raw: &Value) -> Option<Vec<Value>> {
    let obj = raw.as_object()?;
    let prices = pairs_array(obj.get("prices")?)?;
    let caps = obj.get("market_caps").and_then(pairs_array);
    let volumes = obj.get("total_volumes").and_then(pairs_array);

    let mut records = Vec::with_capacity(prices.len());
    for (i, (ts, price)) in prices.iter().enumerate() {
        let mut record = Map::new();
        record.insert("timestamp".into(), ts.clone());
        record.insert("price".into(), price.clone());
        if let Some((_, cap)) = caps.as_ref().and_then(|c| c.get(i)) {
            record.insert("market_cap".into(), cap.clone());
        }
        if let Some((_, volume)) = volumes.as_ref().and_then(|v| v.get(i)) {
            record.insert("volume".into(), volume.clone());
        }
        records.push(Value::Object(record));
    }
    Some(records)
}

/// Interpret a value as `[[ts, v], ...]`.
fn pairs_array(value: &Value) -> Option<Vec<(Value, Value)>> {
    let items = value.as_array()?;
    let mut pairs = Vec::with_capacity(items.len());
    for item in items {
        let pair = item.as_array()?;
        if pair.len() < 2 {
            return None;
        }
        pairs.push((pair[0].clone(), pair[1].clone()));
    }
    Some(pairs)
}

/// Shape 2: every value is itself an object; keys become `crypto_id`.
///
/// Keys are processed in sorted order, which `serde_json`'s map already
/// guarantees.
fn keyed_object_map(raw: &Value) -> Option<Vec<Value>> {
    let obj = raw.as_object()?;
    if obj.is_empty() || !obj.values().all(Value::is_object) {
        return None;
    }
    let mut records = Vec::with_capacity(obj.len());
    for (key, value) in obj {
        let mut record = value.as_object().cloned().unwrap_or_default();
        record.insert("crypto_id".into(), Value::String(key.clone()));
        records.push(Value::Object(record));
    }
    Some(records)
}

/// Shape 3: `{"hourly": {"time": [...], "k1": [...], ...}}` with every
/// parallel array matching the length of `time`.
fn parallel_hourly_arrays(raw: &Value) -> Option<Vec<Value>> {
    let hourly = raw.get("hourly")?.as_object()?;
    let time = hourly.get("time")?.as_array()?;
    let mut records = Vec::with_capacity(time.len());
    for (i, ts) in time.iter().enumerate() {
        let mut record = Map::new();
        record.insert("time".into(), ts.clone());
        for (key, column) in hourly {
            if key == "time" {
                continue;
            }
            let column = column.as_array()?;
            if column.len() != time.len() {
                return None;
            }
            record.insert(key.clone(), column[i].clone());
        }
        records.push(Value::Object(record));
    }
    Some(records)
}

/// Shape 4: `[[header...], [row...], ...]` with an all-string header row.
fn header_rows(raw: &Value) -> Option<Vec<Value>> {
    let rows = raw.as_array()?;
    if rows.len() < 2 {
        return None;
    }
    let header: Vec<&str> = rows[0]
        .as_array()?
        .iter()
        .map(Value::as_str)
        .collect::<Option<Vec<_>>>()?;
    if header.is_empty() {
        return None;
    }

    let mut records = Vec::with_capacity(rows.len() - 1);
    for row in &rows[1..] {
        let cells = row.as_array()?;
        let mut record = Map::new();
        for (name, cell) in header.iter().zip(cells.iter()) {
            record.insert((*name).to_string(), cell.clone());
        }
        records.push(Value::Object(record));
    }
    Some(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn zipped_market_chart_records() {
        let raw = json!({
            "prices": [[1000, 1.5], [2000, 1.6]],
            "market_caps": [[1000, 100.0], [2000, 110.0]],
            "total_volumes": [[1000, 9.0], [2000, 8.0]],
        });
        let records = detect_records(&raw);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["timestamp"], 1000);
        assert_eq!(records[0]["price"], 1.5);
        assert_eq!(records[0]["market_cap"], 100.0);
        assert_eq!(records[1]["volume"], 8.0);
    }

    #[test]
    fn zipped_chart_without_optional_series() {
        let raw = json!({"prices": [[1000, 1.5]]});
        let records = detect_records(&raw);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["price"], 1.5);
        assert!(records[0].get("market_cap").is_none());
    }

    #[test]
    fn keyed_map_records_in_sorted_key_order() {
        let raw = json!({
            "ethereum": {"usd": 2000.0},
            "bitcoin": {"usd": 40000.0},
        });
        let records = detect_records(&raw);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["crypto_id"], "bitcoin");
        assert_eq!(records[1]["crypto_id"], "ethereum");
        assert_eq!(records[0]["usd"], 40000.0);
    }

    #[test]
    fn parallel_hourly_arrays_zip_per_index() {
        let raw = json!({
            "hourly": {
                "time": ["t0", "t1"],
                "temperature_2m": [11.0, 12.0],
                "humidity": [80, 81],
            }
        });
        let records = detect_records(&raw);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["time"], "t0");
        assert_eq!(records[0]["temperature_2m"], 11.0);
        assert_eq!(records[1]["humidity"], 81);
    }

    #[test]
    fn hourly_with_mismatched_lengths_falls_through() {
        let raw = json!({
            "hourly": {"time": ["t0", "t1"], "temperature_2m": [11.0]}
        });
        // Falls back to single-record wrapping.
        let records = detect_records(&raw);
        assert_eq!(records.len(), 1);
        assert!(records[0].get("hourly").is_some());
    }

    #[test]
    fn header_rows_become_keyed_records() {
        let raw = json!([["NAME", "POP"], ["CA", "39538223"], ["TX", "29145505"]]);
        let records = detect_records(&raw);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["NAME"], "CA");
        assert_eq!(records[1]["POP"], "29145505");
    }

    #[test]
    fn short_rows_keep_available_cells() {
        let raw = json!([["A", "B", "C"], ["1", "2"]]);
        let records = detect_records(&raw);
        assert_eq!(records[0]["A"], "1");
        assert!(records[0].get("C").is_none());
    }

    #[test]
    fn results_array_is_unwrapped() {
        let raw = json!({"results": [{"a": 1}, {"a": 2}], "meta": {"count": 2}});
        let records = detect_records(&raw);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["a"], 2);
    }

    #[test]
    fn fallback_wraps_single_value() {
        let raw = json!({"just": "an object"});
        // Not all values are objects, so the keyed-map shape does not fire.
        let records = detect_records(&raw);
        assert_eq!(records, vec![raw]);
    }

    #[test]
    fn scalar_payload_wraps_single_value() {
        let records = detect_records(&json!(42));
        assert_eq!(records, vec![json!(42)]);
    }
}
