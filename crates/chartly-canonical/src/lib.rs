// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic canonical JSON byte encoding for Chartly.
//!
//! Semantically equal inputs must yield byte-equal outputs: object keys are
//! emitted in ascending lexical order, number tokens are passed through
//! verbatim (never re-rendered through `f64`), strings are JSON-escaped, and
//! timestamps are formatted as RFC3339 with trimmed nanoseconds in UTC.
//!
//! Depth and output size are bounded. A subtree that breaches a bound is
//! emitted as `null` and a [`CanonWarning`] is recorded instead of failing
//! the whole document.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

/// JSON number grammar. Tokens that do not match serialize as `null`.
static NUMBER_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-?(0|[1-9][0-9]*)(\.[0-9]+)?([eE][+-]?[0-9]+)?$").unwrap()
});

/// Bounds applied while emitting canonical bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonLimits {
    /// Maximum nesting depth of objects/arrays before the subtree nulls out.
    pub max_depth: usize,
    /// Maximum total output size in bytes.
    pub max_bytes: usize,
}

impl Default for CanonLimits {
    fn default() -> Self {
        Self {
            max_depth: 64,
            max_bytes: 1 << 20,
        }
    }
}

/// Advisory issues recorded while emitting canonical bytes.
///
/// A warning always corresponds to a subtree that was replaced with `null`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonWarning {
    /// A subtree exceeded [`CanonLimits::max_depth`].
    DepthExceeded {
        /// Dotted path of the offending subtree.
        path: String,
    },
    /// Emitting a subtree would have exceeded [`CanonLimits::max_bytes`].
    SizeExceeded {
        /// Dotted path of the offending subtree.
        path: String,
    },
    /// A number token did not match the JSON number grammar.
    BadNumberToken {
        /// Dotted path of the offending value.
        path: String,
        /// The rejected token.
        token: String,
    },
}

impl std::fmt::Display for CanonWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CanonWarning::DepthExceeded { path } => {
                write!(f, "depth limit exceeded at '{path}'")
            }
            CanonWarning::SizeExceeded { path } => {
                write!(f, "size limit exceeded at '{path}'")
            }
            CanonWarning::BadNumberToken { path, token } => {
                write!(f, "invalid number token '{token}' at '{path}'")
            }
        }
    }
}

/// Emits deterministic canonical JSON bytes under configurable bounds.
///
/// # Examples
///
/// ```
/// use chartly_canonical::Canonicalizer;
///
/// let a: serde_json::Value = serde_json::from_str(r#"{"b":1,"a":2}"#).unwrap();
/// let b: serde_json::Value = serde_json::from_str(r#"{"a":2,"b":1}"#).unwrap();
///
/// let canon = Canonicalizer::default();
/// assert_eq!(canon.canonical_bytes(&a).0, canon.canonical_bytes(&b).0);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Canonicalizer {
    limits: CanonLimits,
}

impl Canonicalizer {
    /// Create a canonicalizer with explicit limits.
    #[must_use]
    pub fn new(limits: CanonLimits) -> Self {
        Self { limits }
    }

    /// Emit canonical bytes for `value`.
    ///
    /// Never fails: bound breaches null out the offending subtree and are
    /// reported in the returned warning list.
    #[must_use]
    pub fn canonical_bytes(&self, value: &Value) -> (Vec<u8>, Vec<CanonWarning>) {
        let mut out = Vec::new();
        let mut warnings = Vec::new();
        self.write_value(value, 0, "$", &mut out, &mut warnings);
        (out, warnings)
    }

    fn write_value(
        &self,
        value: &Value,
        depth: usize,
        path: &str,
        out: &mut Vec<u8>,
        warnings: &mut Vec<CanonWarning>,
    ) {
        if depth > self.limits.max_depth {
            out.extend_from_slice(b"null");
            warnings.push(CanonWarning::DepthExceeded { path: path.into() });
            return;
        }

        let mark = out.len();
        match value {
            Value::Null => out.extend_from_slice(b"null"),
            Value::Bool(true) => out.extend_from_slice(b"true"),
            Value::Bool(false) => out.extend_from_slice(b"false"),
            Value::Number(n) => {
                let token = n.to_string();
                if NUMBER_TOKEN.is_match(&token) {
                    out.extend_from_slice(token.as_bytes());
                } else {
                    // Covers non-finite floats and malformed raw tokens.
                    out.extend_from_slice(b"null");
                    warnings.push(CanonWarning::BadNumberToken {
                        path: path.into(),
                        token,
                    });
                }
            }
            Value::String(s) => out.extend_from_slice(escape_string(s).as_bytes()),
            Value::Array(items) => {
                out.push(b'[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(b',');
                    }
                    let child = format!("{path}[{i}]");
                    self.write_value(item, depth + 1, &child, out, warnings);
                }
                out.push(b']');
            }
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort_unstable();
                out.push(b'{');
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(b',');
                    }
                    out.extend_from_slice(escape_string(key).as_bytes());
                    out.push(b':');
                    let child = format!("{path}.{key}");
                    if let Some(item) = map.get(key.as_str()) {
                        self.write_value(item, depth + 1, &child, out, warnings);
                    }
                }
                out.push(b'}');
            }
        }

        if out.len() > self.limits.max_bytes {
            out.truncate(mark);
            out.extend_from_slice(b"null");
            warnings.push(CanonWarning::SizeExceeded { path: path.into() });
        }
    }
}

/// JSON-escape a string, including the surrounding quotes.
fn escape_string(s: &str) -> String {
    // serde_json's own string encoder is the reference escaper.
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".into())
}

/// Format a timestamp as RFC3339 in UTC with trailing fractional zeros
/// trimmed, matching Go's `RFC3339Nano` layout.
///
/// # Examples
///
/// ```
/// use chrono::{TimeZone, Utc};
///
/// let t = Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap();
/// assert_eq!(chartly_canonical::format_rfc3339_nanos(t), "2023-11-14T22:13:20Z");
///
/// let t = t + chrono::Duration::nanoseconds(120_000_000);
/// assert_eq!(chartly_canonical::format_rfc3339_nanos(t), "2023-11-14T22:13:20.12Z");
/// ```
#[must_use]
pub fn format_rfc3339_nanos(ts: DateTime<Utc>) -> String {
    let base = ts.format("%Y-%m-%dT%H:%M:%S").to_string();
    let nanos = ts.timestamp_subsec_nanos();
    if nanos == 0 {
        return format!("{base}Z");
    }
    let mut frac = format!("{nanos:09}");
    while frac.ends_with('0') {
        frac.pop();
    }
    format!("{base}.{frac}Z")
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Returns `true` when `s` is a 64-character lowercase hex string.
#[must_use]
pub fn is_hex64(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
