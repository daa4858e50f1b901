// SPDX-License-Identifier: MIT OR Apache-2.0

//! Source envelopes: the registry's view of an external data source.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    EntityRef, Envelope, EnvelopeError, FailureKind, Failures, MAX_LABELS, MAX_REF_LEN,
    MAX_RELATED, MAX_TENANT_LEN, canonical_metadata_bytes, check_hex_field, check_string_map,
    clean_string_map, is_identifier, metadata_value,
};

/// Operational states a source can be in.
const STATUSES: &[&str] = &["active", "paused", "error", "disabled"];

/// Health grades reported for a source.
const HEALTHS: &[&str] = &["healthy", "degraded", "unhealthy"];

/// URI schemes allowed per source kind.
fn allowed_schemes(kind: &str) -> Option<&'static [&'static str]> {
    match kind {
        "api" => Some(&["https"]),
        "file" => Some(&["s3", "gs", "https"]),
        "db" => Some(&["postgres", "mysql", "mssql", "sqlite"]),
        "stream" => Some(&["kafka", "nats", "mqtt"]),
        _ => None,
    }
}

/// Monotonic operational counters for a source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SourceCounters {
    /// Total executed runs against this source.
    pub runs: u64,
    /// Total failed runs.
    pub errors: u64,
    /// Total records produced.
    pub records: u64,
}

/// Rate and quota limits applied when fetching from a source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SourceLimits {
    /// Requests per second.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rps: Option<u32>,
    /// Maximum concurrent fetches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    /// Daily request quota.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_quota: Option<u64>,
}

/// Expected output schema binding for a source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SchemaBinding {
    /// Kind of output documents this source should produce.
    pub expected_output_kind: String,
    /// Relative path of the governing schema in the schema store.
    pub schema_ref: String,
    /// Pinned hash of the compiled schema, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_hash: Option<String>,
}

/// The registry's record of an external data source.
///
/// Identity is `(tenant, kind, external_ref)` and is immutable; everything
/// else is operational state covered by the metadata hash chain.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SourceEnvelope {
    /// Owning tenant.
    pub tenant: String,
    /// Source kind: `api`, `file`, `db`, or `stream`.
    pub kind: String,
    /// External reference URI (scheme checked per kind).
    pub external_ref: String,

    /// Human-readable display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Operational status: `active`, `paused`, `error`, or `disabled`.
    pub status: String,
    /// Health grade: `healthy`, `degraded`, or `unhealthy`.
    pub health: String,
    /// Monotonic counters.
    #[serde(default)]
    pub counters: SourceCounters,
    /// Operator or service that owns this source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Fetch limits.
    #[serde(default)]
    pub limits: SourceLimits,
    /// Expected output schema binding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaBinding>,
    /// Hash of the last audited configuration document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_audit: Option<String>,
    /// Bounded descriptive labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Bounded related entity references.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_entities: Vec<EntityRef>,

    /// Creation time (UTC).
    pub created: DateTime<Utc>,
    /// Last update time (UTC); never before `created`.
    pub updated: DateTime<Utc>,

    /// Hash of the predecessor envelope in the chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    /// Hash of this envelope's canonical metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl SourceEnvelope {
    /// Create a minimal active, healthy source.
    #[must_use]
    pub fn new(
        tenant: impl Into<String>,
        kind: impl Into<String>,
        external_ref: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            tenant: tenant.into(),
            kind: kind.into(),
            external_ref: external_ref.into(),
            name: None,
            status: "active".into(),
            health: "healthy".into(),
            counters: SourceCounters::default(),
            owner: None,
            limits: SourceLimits::default(),
            schema: None,
            config_audit: None,
            labels: BTreeMap::new(),
            related_entities: Vec::new(),
            created: now,
            updated: now,
            prev_hash: None,
            hash: None,
        }
    }
}

impl Envelope for SourceEnvelope {
    fn normalize(&mut self) {
        self.tenant = self.tenant.trim().to_lowercase();
        self.kind = self.kind.trim().to_lowercase();
        self.external_ref = self.external_ref.trim().to_string();
        self.name = self.name.take().map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        self.status = self.status.trim().to_lowercase();
        self.health = self.health.trim().to_lowercase();
        self.owner = self.owner.take().map(|o| o.trim().to_string()).filter(|o| !o.is_empty());
        self.config_audit = self.config_audit.take().map(|h| h.trim().to_lowercase());
        self.prev_hash = self.prev_hash.take().map(|h| h.trim().to_lowercase());
        self.hash = self.hash.take().map(|h| h.trim().to_lowercase());
        if let Some(schema) = &mut self.schema {
            schema.expected_output_kind = schema.expected_output_kind.trim().to_lowercase();
            schema.schema_ref = schema.schema_ref.trim().to_string();
            schema.schema_hash = schema.schema_hash.take().map(|h| h.trim().to_lowercase());
        }
        clean_string_map(&mut self.labels);
        for entity in &mut self.related_entities {
            entity.normalize();
        }
        self.related_entities.sort();
        self.created = self.created.with_timezone(&Utc);
        self.updated = self.updated.with_timezone(&Utc);
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        let mut failures = Failures::default();

        if self.tenant.is_empty() {
            failures.push(FailureKind::Empty, "tenant", "tenant is required");
        } else if !is_identifier(&self.tenant) {
            failures.push(FailureKind::Invalid, "tenant", "must be a lowercase identifier");
        } else if self.tenant.len() > MAX_TENANT_LEN {
            failures.push(
                FailureKind::TooBig,
                "tenant",
                format!("exceeds {MAX_TENANT_LEN} bytes"),
            );
        }

        let schemes = allowed_schemes(&self.kind);
        if self.kind.is_empty() {
            failures.push(FailureKind::Empty, "kind", "kind is required");
        } else if schemes.is_none() {
            failures.push(
                FailureKind::Invalid,
                "kind",
                "must be one of: api, file, db, stream",
            );
        }

        if self.external_ref.is_empty() {
            failures.push(FailureKind::Empty, "external_ref", "external_ref is required");
        } else if self.external_ref.len() > MAX_REF_LEN {
            failures.push(
                FailureKind::TooBig,
                "external_ref",
                format!("exceeds {MAX_REF_LEN} bytes"),
            );
        } else if let Some(allowed) = schemes {
            match self.external_ref.split_once("://") {
                Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => {
                    if !allowed.contains(&scheme) {
                        failures.push(
                            FailureKind::BadSchemeForKind,
                            "external_ref",
                            format!("scheme '{scheme}' not allowed for kind '{}'", self.kind),
                        );
                    }
                }
                _ => {
                    failures.push(FailureKind::BadUri, "external_ref", "missing URI scheme");
                }
            }
        }

        if !STATUSES.contains(&self.status.as_str()) {
            failures.push(
                FailureKind::Invalid,
                "status",
                "must be one of: active, paused, error, disabled",
            );
        }
        if !HEALTHS.contains(&self.health.as_str()) {
            failures.push(
                FailureKind::Invalid,
                "health",
                "must be one of: healthy, degraded, unhealthy",
            );
        }

        if self.updated < self.created {
            failures.push(FailureKind::Invalid, "updated", "updated precedes created");
        }

        check_hex_field(self.config_audit.as_deref(), "config_audit", &mut failures);
        check_hex_field(
            self.schema.as_ref().and_then(|s| s.schema_hash.as_deref()),
            "schema.schema_hash",
            &mut failures,
        );
        check_hex_field(self.prev_hash.as_deref(), "prev_hash", &mut failures);
        check_hex_field(self.hash.as_deref(), "hash", &mut failures);

        check_string_map(&self.labels, "labels", MAX_LABELS, &mut failures);

        if self.related_entities.len() > MAX_RELATED {
            failures.push(
                FailureKind::TooMany,
                "related_entities",
                format!("{} entries exceed the {MAX_RELATED} cap", self.related_entities.len()),
            );
        }
        for (i, entity) in self.related_entities.iter().enumerate() {
            entity.check(&format!("related_entities[{i}]"), &self.tenant, &mut failures);
        }

        failures.finish()
    }

    fn identity_bytes(&self) -> Vec<u8> {
        format!("{}|{}|{}", self.tenant, self.kind, self.external_ref).into_bytes()
    }

    fn metadata_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let v = metadata_value(self, &[("created", self.created), ("updated", self.updated)])?;
        canonical_metadata_bytes(&v)
    }

    fn prev_hash(&self) -> Option<&str> {
        self.prev_hash.as_deref()
    }

    fn set_prev_hash(&mut self, prev: Option<String>) {
        self.prev_hash = prev;
    }

    fn stored_hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    fn set_hash(&mut self, hash: Option<String>) {
        self.hash = hash;
    }
}
