// SPDX-License-Identifier: MIT OR Apache-2.0

//! Record enrichment: derived dimensions and measure coercion.
//!
//! Every pass here is idempotent and never overwrites a value that is
//! already present.

use chrono::Datelike;
use serde_json::{Number, Value};

use crate::mapping::set_nested_value;

/// Inject `dims.crypto_id` and `dims.timeframe` from profile ids shaped
/// `crypto-<id>-<timeframe>`. The aggregate id `top10` is excluded, and
/// dimensions that are already set stay untouched.
pub fn inject_crypto_dims(record: &mut Value, profile_id: &str) {
    let Some(rest) = profile_id.strip_prefix("crypto-") else {
        return;
    };
    let Some((crypto_id, timeframe)) = rest.rsplit_once('-') else {
        return;
    };
    if crypto_id.is_empty() || timeframe.is_empty() || crypto_id == "top10" {
        return;
    }

    let has_crypto_id = record
        .get("dims")
        .and_then(|d| d.get("crypto_id"))
        .is_some();
    if !has_crypto_id {
        set_nested_value(record, "dims.crypto_id", Value::String(crypto_id.to_string()));
    }
    let has_timeframe = record
        .get("dims")
        .and_then(|d| d.get("timeframe"))
        .is_some();
    if !has_timeframe {
        set_nested_value(record, "dims.timeframe", Value::String(timeframe.to_string()));
    }
}

/// Coerce string measures into numbers throughout the `measures.*` subtree.
///
/// A trimmed string that parses as a finite `f64` is replaced with the
/// parsed number; strings whose digit sequence carries a leading zero
/// (`"01"`) are preserved as strings, since they are identifiers rather
/// than quantities.
pub fn coerce_measures(record: &mut Value) {
    if let Some(measures) = record.get_mut("measures") {
        coerce_in_place(measures);
    }
}

fn coerce_in_place(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for child in map.values_mut() {
                coerce_in_place(child);
            }
        }
        Value::Array(items) => {
            for child in items.iter_mut() {
                coerce_in_place(child);
            }
        }
        Value::String(s) => {
            if let Some(number) = parse_measure(s) {
                *value = Value::Number(number);
            }
        }
        _ => {}
    }
}

fn parse_measure(s: &str) -> Option<Number> {
    let trimmed = s.trim();
    if trimmed.is_empty() || has_leading_zero(trimmed) {
        return None;
    }
    let parsed: f64 = trimmed.parse().ok()?;
    if !parsed.is_finite() {
        return None;
    }
    // Prefer the original token when it is already a valid JSON number so
    // the value survives without float re-rendering.
    if let Ok(number) = serde_json::from_str::<Number>(trimmed) {
        return Some(number);
    }
    Number::from_f64(parsed)
}

/// Returns `true` for digit sequences like `"01"` or `"-007"` that must
/// stay strings.
fn has_leading_zero(s: &str) -> bool {
    let digits = s.strip_prefix('-').unwrap_or(s);
    let mut chars = digits.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some('0'), Some(c)) if c.is_ascii_digit()
    )
}

/// Fill `dims.time.{date,year,month}` from an RFC3339 `occurred_at`,
/// looked up first at `dims.time.occurred_at` and then at the top level.
/// Existing values are never overwritten.
pub fn fill_time_dims(record: &mut Value) {
    let occurred_at = record
        .get("dims")
        .and_then(|d| d.get("time"))
        .and_then(|t| t.get("occurred_at"))
        .or_else(|| record.get("occurred_at"))
        .and_then(Value::as_str);
    let Some(occurred_at) = occurred_at else {
        return;
    };
    let Ok(parsed) = chrono::DateTime::parse_from_rfc3339(occurred_at) else {
        return;
    };
    let utc = parsed.to_utc();

    let time = record.get("dims").and_then(|d| d.get("time"));
    let has = |field: &str| time.is_some_and(|t| t.get(field).is_some());
    let has_date = has("date");
    let has_year = has("year");
    let has_month = has("month");

    if !has_date {
        set_nested_value(
            record,
            "dims.time.date",
            Value::String(utc.format("%Y-%m-%d").to_string()),
        );
    }
    if !has_year {
        set_nested_value(record, "dims.time.year", Value::Number(utc.year().into()));
    }
    if !has_month {
        set_nested_value(record, "dims.time.month", Value::Number(utc.month().into()));
    }
}
