// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical envelopes for Chartly: Sources, Events, Metrics, and Artifacts.
//!
//! Every envelope supports the same lifecycle: [`Envelope::normalize`] brings
//! the document into canonical shape, [`Envelope::validate`] enforces the
//! structural invariants, and the [`Envelope::compute_hash`] /
//! [`Envelope::verify_hash`] pair maintains the tamper-evident
//! `prev_hash`/`hash` chain over the canonical metadata bytes.
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod artifact;
mod chain;
mod event;
mod metric;
mod source;

pub use artifact::{ArtifactContent, ArtifactEnvelope, UriPolicy};
pub use chain::{ChainError, verify_chain};
pub use event::EventEnvelope;
pub use metric::{HistogramBucket, MetricEnvelope, SummaryQuantile};
pub use source::{SchemaBinding, SourceCounters, SourceEnvelope, SourceLimits};

use chartly_canonical::{Canonicalizer, sha256_hex};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Shared bounds
// ---------------------------------------------------------------------------

/// Maximum number of label pairs on any envelope.
pub const MAX_LABELS: usize = 64;
/// Maximum number of attribute pairs on any envelope.
pub const MAX_ATTRIBUTES: usize = 64;
/// Maximum number of related entity references on any envelope.
pub const MAX_RELATED: usize = 100;
/// Maximum length of a label or attribute key.
pub const MAX_KEY_LEN: usize = 128;
/// Maximum length of a label or attribute string value.
pub const MAX_VALUE_LEN: usize = 1024;
/// Maximum length of a tenant identifier.
pub const MAX_TENANT_LEN: usize = 128;
/// Maximum length of a name or kind field.
pub const MAX_NAME_LEN: usize = 256;
/// Maximum length of an external reference URI.
pub const MAX_REF_LEN: usize = 2048;

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

/// Stable classification of a validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A required field is missing or blank.
    Empty,
    /// A field has invalid syntax or an out-of-range value.
    Invalid,
    /// A field or document exceeds its size cap.
    TooBig,
    /// A bounded collection has too many entries.
    TooMany,
    /// A hash field is not 64-character lowercase hex.
    BadHash,
    /// A URI could not be parsed or lacks a scheme.
    BadUri,
    /// The URI scheme is not allowed for the envelope's kind.
    BadSchemeForKind,
    /// A nested subject entity reference is invalid.
    SubjectInvalid,
    /// A nested reference names a different tenant.
    TenantMismatch,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Empty => "empty",
            FailureKind::Invalid => "invalid",
            FailureKind::TooBig => "too_big",
            FailureKind::TooMany => "too_many",
            FailureKind::BadHash => "bad_hash",
            FailureKind::BadUri => "bad_uri",
            FailureKind::BadSchemeForKind => "bad_scheme_for_kind",
            FailureKind::SubjectInvalid => "subject_invalid",
            FailureKind::TenantMismatch => "tenant_mismatch",
        };
        f.write_str(s)
    }
}

/// A single validation failure with its field path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Stable failure classification.
    pub kind: FailureKind,
    /// Field that failed (dotted path).
    pub field: String,
    /// Human-readable detail.
    pub message: String,
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.kind)
    }
}

/// Errors from envelope validation and hashing.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    /// One or more structural invariants were violated.
    #[error("envelope validation failed: {failures:?}")]
    Validation {
        /// Individual failures, in field order.
        failures: Vec<Failure>,
    },

    /// The envelope could not be serialized for hashing.
    #[error("failed to serialize envelope: {0}")]
    Json(#[from] serde_json::Error),

    /// Canonicalization reported a bound breach on a validated envelope.
    #[error("canonicalization breached a bound at '{path}'")]
    Canon {
        /// Path of the subtree that breached the bound.
        path: String,
    },
}

impl EnvelopeError {
    /// Returns the failure list when this is a validation error.
    #[must_use]
    pub fn failures(&self) -> &[Failure] {
        match self {
            EnvelopeError::Validation { failures } => failures,
            _ => &[],
        }
    }
}

/// Collects failures during a validation pass and finalizes into a result.
#[derive(Debug, Default)]
pub(crate) struct Failures(Vec<Failure>);

impl Failures {
    pub(crate) fn push(&mut self, kind: FailureKind, field: &str, message: impl Into<String>) {
        self.0.push(Failure {
            kind,
            field: field.into(),
            message: message.into(),
        });
    }

    pub(crate) fn finish(self) -> Result<(), EnvelopeError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(EnvelopeError::Validation { failures: self.0 })
        }
    }
}

// ---------------------------------------------------------------------------
// Entity references
// ---------------------------------------------------------------------------

/// A reference to another entity, scoped to a tenant.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema, Default,
)]
pub struct EntityRef {
    /// Tenant that owns the referenced entity.
    pub tenant: String,
    /// Entity kind (e.g. `"source"`, `"run"`).
    pub kind: String,
    /// Entity identifier within the tenant and kind.
    pub id: String,
}

impl EntityRef {
    pub(crate) fn normalize(&mut self) {
        self.tenant = self.tenant.trim().to_lowercase();
        self.kind = self.kind.trim().to_lowercase();
        self.id = self.id.trim().to_string();
    }

    pub(crate) fn check(&self, field: &str, owner_tenant: &str, failures: &mut Failures) {
        if self.tenant.is_empty() || self.kind.is_empty() || self.id.is_empty() {
            failures.push(
                FailureKind::SubjectInvalid,
                field,
                "tenant, kind, and id are all required",
            );
            return;
        }
        if !is_identifier(&self.tenant) || !is_identifier(&self.kind) {
            failures.push(
                FailureKind::SubjectInvalid,
                field,
                "tenant and kind must be lowercase identifiers",
            );
        }
        if !owner_tenant.is_empty() && self.tenant != owner_tenant {
            failures.push(
                FailureKind::TenantMismatch,
                field,
                format!("reference tenant '{}' != envelope tenant '{owner_tenant}'", self.tenant),
            );
        }
    }
}

// ---------------------------------------------------------------------------
// The envelope contract
// ---------------------------------------------------------------------------

/// Common lifecycle shared by all canonical envelopes.
///
/// # Examples
///
/// ```
/// use chartly_envelope::{Envelope, SourceEnvelope};
///
/// let mut source = SourceEnvelope::new("acme", "api", "https://api.example.com/v1");
/// let hash = source.compute_hash(None).unwrap();
/// assert_eq!(hash.len(), 64);
/// assert!(source.verify_hash());
/// ```
pub trait Envelope: Clone {
    /// Bring the envelope into canonical shape: lowercase kinds/status,
    /// trimmed strings, UTC times, lowercase hex, bounded cleaned maps, and
    /// sorted logical collections.
    fn normalize(&mut self);

    /// Enforce structural invariants, collecting every failure.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Validation`] with all failures found.
    fn validate(&self) -> Result<(), EnvelopeError>;

    /// Stable identity bytes used for content-addressed deduplication.
    fn identity_bytes(&self) -> Vec<u8>;

    /// Canonical bytes of the envelope metadata, including `prev_hash` and
    /// excluding `hash`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Json`] if serialization fails, or
    /// [`EnvelopeError::Canon`] if a canonical bound is breached.
    fn metadata_bytes(&self) -> Result<Vec<u8>, EnvelopeError>;

    /// The stored content hash, where the envelope carries one (artifacts).
    fn content_hash(&self) -> Option<String> {
        None
    }

    /// Read the chain predecessor hash.
    fn prev_hash(&self) -> Option<&str>;
    /// Set the chain predecessor hash.
    fn set_prev_hash(&mut self, prev: Option<String>);
    /// Read the stored metadata hash.
    fn stored_hash(&self) -> Option<&str>;
    /// Set the stored metadata hash.
    fn set_hash(&mut self, hash: Option<String>);

    /// Normalize, validate, and seal the envelope into the hash chain.
    ///
    /// Sets `prev_hash = lowercase(prev)`, clears `hash`, then stores and
    /// returns `hex(sha256(metadata_bytes()))`.
    ///
    /// # Errors
    ///
    /// Propagates validation and serialization failures; the hash is not
    /// set when an error is returned.
    fn compute_hash(&mut self, prev: Option<&str>) -> Result<String, EnvelopeError> {
        self.set_prev_hash(prev.map(|p| p.trim().to_lowercase()));
        self.set_hash(None);
        self.normalize();
        self.validate()?;
        let bytes = self.metadata_bytes()?;
        let hash = sha256_hex(&bytes);
        self.set_hash(Some(hash.clone()));
        Ok(hash)
    }

    /// Recompute the metadata hash and compare it with the stored hash in
    /// constant time. Returns `false` when no hash is stored.
    fn verify_hash(&self) -> bool {
        let Some(stored) = self.stored_hash() else {
            return false;
        };
        let mut copy = self.clone();
        copy.set_hash(None);
        copy.normalize();
        if copy.validate().is_err() {
            return false;
        }
        match copy.metadata_bytes() {
            Ok(bytes) => constant_time_eq(sha256_hex(&bytes).as_bytes(), stored.as_bytes()),
            Err(_) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Byte-wise comparison that does not short-circuit on the first mismatch.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Returns `true` for lowercase identifiers: `[a-z0-9][a-z0-9._-]*`.
pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
}

/// Normalize a label/attribute map in place: trim and lowercase keys, trim
/// string values, and drop entries whose key is empty or oversize.
pub(crate) fn clean_string_map(map: &mut std::collections::BTreeMap<String, String>) {
    let entries = std::mem::take(map);
    for (k, v) in entries {
        let key = k.trim().to_lowercase();
        if key.is_empty() || key.len() > MAX_KEY_LEN {
            continue;
        }
        map.insert(key, v.trim().to_string());
    }
}

/// Validate a cleaned label/attribute map against the shared bounds.
pub(crate) fn check_string_map(
    map: &std::collections::BTreeMap<String, String>,
    field: &str,
    max_entries: usize,
    failures: &mut Failures,
) {
    if map.len() > max_entries {
        failures.push(
            FailureKind::TooMany,
            field,
            format!("{} entries exceed the {max_entries} cap", map.len()),
        );
    }
    for (k, v) in map {
        if !is_identifier(k) {
            failures.push(FailureKind::Invalid, field, format!("key '{k}' is not an identifier"));
        }
        if v.len() > MAX_VALUE_LEN {
            failures.push(
                FailureKind::TooBig,
                field,
                format!("value for '{k}' exceeds {MAX_VALUE_LEN} bytes"),
            );
        }
    }
}

/// Validate an optional 64-hex hash field.
pub(crate) fn check_hex_field(value: Option<&str>, field: &str, failures: &mut Failures) {
    if let Some(h) = value
        && !chartly_canonical::is_hex64(h)
    {
        failures.push(
            FailureKind::BadHash,
            field,
            "must be a 64-character lowercase hex digest",
        );
    }
}

/// Canonicalize a metadata value, mapping bound breaches to errors.
pub(crate) fn canonical_metadata_bytes(value: &Value) -> Result<Vec<u8>, EnvelopeError> {
    let (bytes, warnings) = Canonicalizer::default().canonical_bytes(value);
    if let Some(first) = warnings.first() {
        let path = match first {
            chartly_canonical::CanonWarning::DepthExceeded { path }
            | chartly_canonical::CanonWarning::SizeExceeded { path }
            | chartly_canonical::CanonWarning::BadNumberToken { path, .. } => path.clone(),
        };
        return Err(EnvelopeError::Canon { path });
    }
    Ok(bytes)
}

/// Serialize an envelope to a JSON object, drop its `hash` field, and
/// rewrite timestamp fields to RFC3339Nano strings.
pub(crate) fn metadata_value<T: Serialize>(
    envelope: &T,
    time_fields: &[(&str, chrono::DateTime<chrono::Utc>)],
) -> Result<Value, EnvelopeError> {
    let mut v = serde_json::to_value(envelope)?;
    if let Value::Object(map) = &mut v {
        map.remove("hash");
        for (field, ts) in time_fields {
            map.insert(
                (*field).to_string(),
                Value::String(chartly_canonical::format_rfc3339_nanos(*ts)),
            );
        }
    }
    Ok(v)
}
