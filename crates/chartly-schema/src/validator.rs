// SPDX-License-Identifier: MIT OR Apache-2.0

//! Constrained JSON-Schema subset validator with arbitrary-precision
//! numeric comparison.

use bigdecimal::BigDecimal;
use regex::Regex;
use serde_json::Value;
use std::str::FromStr;

/// Keywords the validator evaluates.
const HANDLED: &[&str] = &[
    "type",
    "const",
    "enum",
    "minLength",
    "maxLength",
    "pattern",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "minItems",
    "maxItems",
    "items",
    "required",
    "properties",
    "additionalProperties",
    "allOf",
    "anyOf",
    "oneOf",
    "not",
];

/// Annotation keywords that are never evaluated; warned when configured.
const IGNORED_ANNOTATIONS: &[&str] = &[
    "format",
    "title",
    "description",
    "$comment",
    "default",
    "examples",
    "deprecated",
    "readOnly",
    "writeOnly",
];

/// Structural keywords that are silently skipped (ref containers and ids).
const IGNORED_SILENT: &[&str] = &["$defs", "definitions", "defs", "$schema", "$id"];

/// Severity of a reported violation. Errors sort before warnings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// The instance does not satisfy the schema.
    Error,
    /// Advisory only; the instance is still considered valid.
    Warning,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Error => f.write_str("error"),
            Severity::Warning => f.write_str("warning"),
        }
    }
}

/// One schema violation, anchored in both the instance and the schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Dotted path into the instance.
    pub path: String,
    /// JSON-pointer into the compiled schema.
    pub schema_at: String,
    /// Error or warning.
    pub severity: Severity,
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable detail.
    pub message: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} at {} (schema {}): {}",
            self.severity, self.code, self.path, self.schema_at, self.message
        )
    }
}

/// A finalized validation report with violations in stable order.
#[derive(Debug, Clone, Default)]
pub struct Report {
    /// Violations sorted by (severity, code, path, schema_at, message).
    pub violations: Vec<Violation>,
}

impl Report {
    /// Returns `true` when no error-severity violations were recorded.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self
            .violations
            .iter()
            .any(|v| v.severity == Severity::Error)
    }

    fn finalize(mut violations: Vec<Violation>) -> Self {
        violations.sort_by(|a, b| {
            (a.severity, &a.code, &a.path, &a.schema_at, &a.message).cmp(&(
                b.severity, &b.code, &b.path, &b.schema_at, &b.message,
            ))
        });
        Self { violations }
    }
}

/// Knobs for the validator.
#[derive(Debug, Clone, Copy)]
pub struct ValidatorOptions {
    /// Maximum recursion depth over the instance/schema pair.
    pub max_depth: usize,
    /// Maximum compiled patterns retained in the regex cache.
    pub regex_cache_size: usize,
    /// Decimal precision applied before numeric comparison.
    pub precision: u64,
    /// Emit warnings for unknown and annotation-only keywords.
    pub warn_unknown: bool,
}

impl Default for ValidatorOptions {
    fn default() -> Self {
        Self {
            max_depth: 64,
            regex_cache_size: 64,
            precision: 50,
            warn_unknown: false,
        }
    }
}

/// Bounded pattern cache with insertion-order eviction.
///
/// Failed compiles are cached too, so a bad pattern is compiled once and
/// reported on every use without panicking.
#[derive(Debug, Default)]
struct RegexCache {
    capacity: usize,
    entries: Vec<(String, Option<Regex>)>,
}

impl RegexCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Vec::new(),
        }
    }

    fn get(&mut self, pattern: &str) -> Option<Regex> {
        if let Some((_, compiled)) = self.entries.iter().find(|(p, _)| p == pattern) {
            return compiled.clone();
        }
        let compiled = Regex::new(pattern).ok();
        if self.entries.len() >= self.capacity {
            self.entries.remove(0);
        }
        self.entries.push((pattern.to_string(), compiled.clone()));
        compiled
    }
}

/// Validates instances against compiled schema subsets.
///
/// # Examples
///
/// ```
/// use chartly_schema::{Validator, ValidatorOptions};
///
/// let schema = serde_json::json!({
///     "type": "object",
///     "required": ["name"],
///     "properties": {"name": {"type": "string", "minLength": 1}},
/// });
/// let mut validator = Validator::new(ValidatorOptions::default());
///
/// assert!(validator.validate(&schema, &serde_json::json!({"name": "x"})).is_valid());
/// assert!(!validator.validate(&schema, &serde_json::json!({})).is_valid());
/// ```
#[derive(Debug)]
pub struct Validator {
    opts: ValidatorOptions,
    cache: RegexCache,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(ValidatorOptions::default())
    }
}

impl Validator {
    /// Create a validator with explicit options.
    #[must_use]
    pub fn new(opts: ValidatorOptions) -> Self {
        Self {
            cache: RegexCache::new(opts.regex_cache_size),
            opts,
        }
    }

    /// Validate `instance` against `schema`, returning a finalized report.
    pub fn validate(&mut self, schema: &Value, instance: &Value) -> Report {
        let mut out = Vec::new();
        self.check(schema, instance, "$", "", 0, &mut out);
        Report::finalize(out)
    }

    #[allow(clippy::too_many_lines)]
    fn check(
        &mut self,
        schema: &Value,
        instance: &Value,
        path: &str,
        schema_at: &str,
        depth: usize,
        out: &mut Vec<Violation>,
    ) {
        if depth > self.opts.max_depth {
            push(out, path, schema_at, "max_depth", "validation recursion bound reached");
            return;
        }

        // Boolean schemas: `true` admits everything, `false` nothing.
        match schema {
            Value::Bool(true) => return,
            Value::Bool(false) => {
                push(out, path, schema_at, "schema_false", "schema admits no instances");
                return;
            }
            Value::Object(_) => {}
            _ => {
                push(out, path, schema_at, "schema_invalid", "schema must be an object or boolean");
                return;
            }
        }
        let Some(schema_map) = schema.as_object() else {
            return;
        };

        if self.opts.warn_unknown {
            for key in schema_map.keys() {
                if !HANDLED.contains(&key.as_str()) && !IGNORED_SILENT.contains(&key.as_str()) {
                    let detail = if IGNORED_ANNOTATIONS.contains(&key.as_str()) {
                        "annotation-only keyword is not evaluated"
                    } else {
                        "keyword is not supported"
                    };
                    out.push(Violation {
                        path: path.to_string(),
                        schema_at: format!("{schema_at}/{key}"),
                        severity: Severity::Warning,
                        code: "unknown_keyword".into(),
                        message: format!("'{key}': {detail}"),
                    });
                }
            }
        }

        // type
        if let Some(type_spec) = schema_map.get("type") {
            let names: Vec<&str> = match type_spec {
                Value::String(s) => vec![s.as_str()],
                Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
                _ => Vec::new(),
            };
            if names.is_empty() {
                push(out, path, &format!("{schema_at}/type"), "schema_invalid", "type must be a string or array of strings");
            } else if !names.iter().any(|n| type_matches(n, instance)) {
                push(
                    out,
                    path,
                    &format!("{schema_at}/type"),
                    "type",
                    &format!("expected {}, got {}", names.join(" or "), type_of(instance)),
                );
            }
        }

        // const / enum
        if let Some(expected) = schema_map.get("const")
            && !deep_equal(expected, instance)
        {
            push(out, path, &format!("{schema_at}/const"), "const", "instance does not equal the const value");
        }
        if let Some(Value::Array(choices)) = schema_map.get("enum")
            && !choices.iter().any(|c| deep_equal(c, instance))
        {
            push(out, path, &format!("{schema_at}/enum"), "enum", "instance matches no enum value");
        }

        // string keywords
        if let Value::String(s) = instance {
            let chars = s.chars().count();
            if let Some(min) = schema_map.get("minLength").and_then(Value::as_u64)
                && (chars as u64) < min
            {
                push(out, path, &format!("{schema_at}/minLength"), "min_length", &format!("length {chars} < {min}"));
            }
            if let Some(max) = schema_map.get("maxLength").and_then(Value::as_u64)
                && (chars as u64) > max
            {
                push(out, path, &format!("{schema_at}/maxLength"), "max_length", &format!("length {chars} > {max}"));
            }
            if let Some(Value::String(pattern)) = schema_map.get("pattern") {
                match self.cache.get(pattern) {
                    Some(re) => {
                        if !re.is_match(s) {
                            push(out, path, &format!("{schema_at}/pattern"), "pattern", &format!("does not match /{pattern}/"));
                        }
                    }
                    None => {
                        push(
                            out,
                            path,
                            &format!("{schema_at}/pattern"),
                            "pattern_invalid",
                            &format!("pattern /{pattern}/ does not compile"),
                        );
                    }
                }
            }
        }

        // numeric keywords
        if let Value::Number(n) = instance
            && let Some(actual) = self.decimal(&n.to_string())
        {
            for (keyword, code, ok) in [
                ("minimum", "minimum", Ordering::GreaterEq),
                ("maximum", "maximum", Ordering::LessEq),
                ("exclusiveMinimum", "exclusive_minimum", Ordering::Greater),
                ("exclusiveMaximum", "exclusive_maximum", Ordering::Less),
            ] {
                if let Some(Value::Number(bound)) = schema_map.get(keyword)
                    && let Some(bound) = self.decimal(&bound.to_string())
                    && !ok.holds(&actual, &bound)
                {
                    push(
                        out,
                        path,
                        &format!("{schema_at}/{keyword}"),
                        code,
                        &format!("value violates {keyword} {bound}"),
                    );
                }
            }
        }

        // array keywords
        if let Value::Array(items) = instance {
            if let Some(min) = schema_map.get("minItems").and_then(Value::as_u64)
                && (items.len() as u64) < min
            {
                push(out, path, &format!("{schema_at}/minItems"), "min_items", &format!("{} items < {min}", items.len()));
            }
            if let Some(max) = schema_map.get("maxItems").and_then(Value::as_u64)
                && (items.len() as u64) > max
            {
                push(out, path, &format!("{schema_at}/maxItems"), "max_items", &format!("{} items > {max}", items.len()));
            }
            if let Some(item_schema) = schema_map.get("items") {
                for (i, item) in items.iter().enumerate() {
                    self.check(
                        item_schema,
                        item,
                        &format!("{path}[{i}]"),
                        &format!("{schema_at}/items"),
                        depth + 1,
                        out,
                    );
                }
            }
        }

        // object keywords
        if let Value::Object(obj) = instance {
            if let Some(Value::Array(required)) = schema_map.get("required") {
                for key in required.iter().filter_map(Value::as_str) {
                    if !obj.contains_key(key) {
                        push(
                            out,
                            path,
                            &format!("{schema_at}/required"),
                            "required",
                            &format!("missing required property '{key}'"),
                        );
                    }
                }
            }

            let properties = schema_map.get("properties").and_then(Value::as_object);
            if let Some(properties) = properties {
                for (key, prop_schema) in properties {
                    if let Some(value) = obj.get(key) {
                        self.check(
                            prop_schema,
                            value,
                            &format!("{path}.{key}"),
                            &format!("{schema_at}/properties/{key}"),
                            depth + 1,
                            out,
                        );
                    }
                }
            }

            if let Some(additional) = schema_map.get("additionalProperties") {
                for (key, value) in obj {
                    if properties.is_some_and(|p| p.contains_key(key)) {
                        continue;
                    }
                    match additional {
                        Value::Bool(false) => {
                            push(
                                out,
                                &format!("{path}.{key}"),
                                &format!("{schema_at}/additionalProperties"),
                                "additional_properties",
                                &format!("property '{key}' is not allowed"),
                            );
                        }
                        Value::Bool(true) => {}
                        schema => self.check(
                            schema,
                            value,
                            &format!("{path}.{key}"),
                            &format!("{schema_at}/additionalProperties"),
                            depth + 1,
                            out,
                        ),
                    }
                }
            }
        }

        // composition
        if let Some(Value::Array(all)) = schema_map.get("allOf") {
            for (i, sub) in all.iter().enumerate() {
                self.check(sub, instance, path, &format!("{schema_at}/allOf/{i}"), depth + 1, out);
            }
        }
        if let Some(Value::Array(any)) = schema_map.get("anyOf") {
            let matched = any.iter().enumerate().any(|(i, sub)| {
                let mut scratch = Vec::new();
                self.check(sub, instance, path, &format!("{schema_at}/anyOf/{i}"), depth + 1, &mut scratch);
                scratch.iter().all(|v| v.severity != Severity::Error)
            });
            if !matched {
                push(out, path, &format!("{schema_at}/anyOf"), "any_of", "no alternative matched");
            }
        }
        if let Some(Value::Array(one)) = schema_map.get("oneOf") {
            let matches = one
                .iter()
                .enumerate()
                .filter(|(i, sub)| {
                    let mut scratch = Vec::new();
                    self.check(sub, instance, path, &format!("{schema_at}/oneOf/{i}"), depth + 1, &mut scratch);
                    scratch.iter().all(|v| v.severity != Severity::Error)
                })
                .count();
            if matches != 1 {
                push(
                    out,
                    path,
                    &format!("{schema_at}/oneOf"),
                    "one_of",
                    &format!("{matches} alternatives matched, expected exactly 1"),
                );
            }
        }
        if let Some(sub) = schema_map.get("not") {
            let mut scratch = Vec::new();
            self.check(sub, instance, path, &format!("{schema_at}/not"), depth + 1, &mut scratch);
            if scratch.iter().all(|v| v.severity != Severity::Error) {
                push(out, path, &format!("{schema_at}/not"), "not", "instance matches the forbidden schema");
            }
        }
    }

    /// Parse a number token at the configured precision.
    fn decimal(&self, token: &str) -> Option<BigDecimal> {
        BigDecimal::from_str(token)
            .ok()
            .map(|d| d.with_prec(self.opts.precision))
    }
}

/// Comparison direction for numeric bound keywords.
#[derive(Clone, Copy)]
enum Ordering {
    GreaterEq,
    LessEq,
    Greater,
    Less,
}

impl Ordering {
    fn holds(self, actual: &BigDecimal, bound: &BigDecimal) -> bool {
        match self {
            Ordering::GreaterEq => actual >= bound,
            Ordering::LessEq => actual <= bound,
            Ordering::Greater => actual > bound,
            Ordering::Less => actual < bound,
        }
    }
}

fn push(out: &mut Vec<Violation>, path: &str, schema_at: &str, code: &str, message: &str) {
    out.push(Violation {
        path: path.to_string(),
        schema_at: schema_at.to_string(),
        severity: Severity::Error,
        code: code.to_string(),
        message: message.to_string(),
    });
}

fn type_of(instance: &Value) -> &'static str {
    match instance {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn type_matches(name: &str, instance: &Value) -> bool {
    match name {
        "null" => instance.is_null(),
        "boolean" => instance.is_boolean(),
        "string" => instance.is_string(),
        "number" => instance.is_number(),
        "array" => instance.is_array(),
        "object" => instance.is_object(),
        "integer" => match instance {
            Value::Number(n) => BigDecimal::from_str(&n.to_string())
                .map(|d| d.is_integer())
                .unwrap_or(false),
            _ => false,
        },
        _ => false,
    }
}

/// Structural equality with numeric equality via arbitrary precision, so
/// `1.0` equals `1` for `const` and `enum`.
fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            match (
                BigDecimal::from_str(&x.to_string()),
                BigDecimal::from_str(&y.to_string()),
            ) {
                (Ok(x), Ok(y)) => x == y,
                _ => false,
            }
        }
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| deep_equal(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| deep_equal(v, w)))
        }
        _ => a == b,
    }
}
