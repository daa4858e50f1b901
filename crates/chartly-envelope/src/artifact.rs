// SPDX-License-Identifier: MIT OR Apache-2.0

//! Artifact envelopes: references to externally stored content blobs.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    EntityRef, Envelope, EnvelopeError, FailureKind, Failures, MAX_ATTRIBUTES, MAX_NAME_LEN,
    MAX_REF_LEN, MAX_RELATED, MAX_TENANT_LEN, canonical_metadata_bytes, check_hex_field,
    check_string_map, clean_string_map, is_identifier, metadata_value,
};

/// URI scheme policy for artifact content.
///
/// `https`, `s3`, and `gs` are always accepted; `file` is opt-in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UriPolicy {
    /// Accept `file://` URIs.
    pub allow_file: bool,
}

impl UriPolicy {
    fn allows(&self, scheme: &str) -> bool {
        matches!(scheme, "https" | "s3" | "gs") || (self.allow_file && scheme == "file")
    }
}

/// Location and digest of an artifact's content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactContent {
    /// Content URI.
    pub uri: String,
    /// SHA-256 digest of the content bytes (64-character lowercase hex).
    pub sha256: String,
    /// MIME type, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Content size in bytes, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

/// A reference to externally stored content produced for a tenant.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactEnvelope {
    /// Owning tenant.
    pub tenant: String,
    /// Artifact kind (e.g. `"report"`, `"snapshot"`).
    pub kind: String,
    /// Observation time (UTC).
    pub observed: DateTime<Utc>,

    /// Entity the artifact is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<EntityRef>,
    /// Correlating event identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    /// Content location and digest.
    pub content: ArtifactContent,

    /// Bounded related entity references.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related: Vec<EntityRef>,
    /// Bounded descriptive attributes (keys normalized).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,

    /// Hash of the predecessor envelope in the chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    /// Hash of this envelope's canonical metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl ArtifactEnvelope {
    /// Create a minimal artifact.
    #[must_use]
    pub fn new(
        tenant: impl Into<String>,
        kind: impl Into<String>,
        uri: impl Into<String>,
        sha256: impl Into<String>,
        observed: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            kind: kind.into(),
            observed,
            subject: None,
            event_id: None,
            content: ArtifactContent {
                uri: uri.into(),
                sha256: sha256.into(),
                content_type: None,
                size_bytes: None,
            },
            related: Vec::new(),
            attributes: BTreeMap::new(),
            prev_hash: None,
            hash: None,
        }
    }

    /// Validate under an explicit URI scheme policy.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::Validation`] with all failures found.
    pub fn validate_with(&self, policy: &UriPolicy) -> Result<(), EnvelopeError> {
        let mut failures = Failures::default();

        if self.tenant.is_empty() {
            failures.push(FailureKind::Empty, "tenant", "tenant is required");
        } else if !is_identifier(&self.tenant) || self.tenant.len() > MAX_TENANT_LEN {
            failures.push(FailureKind::Invalid, "tenant", "must be a bounded lowercase identifier");
        }

        if self.kind.is_empty() {
            failures.push(FailureKind::Empty, "kind", "kind is required");
        } else if !is_identifier(&self.kind) || self.kind.len() > MAX_NAME_LEN {
            failures.push(FailureKind::Invalid, "kind", "must be a bounded lowercase identifier");
        }

        if self.content.uri.is_empty() {
            failures.push(FailureKind::Empty, "content.uri", "content.uri is required");
        } else if self.content.uri.len() > MAX_REF_LEN {
            failures.push(
                FailureKind::TooBig,
                "content.uri",
                format!("exceeds {MAX_REF_LEN} bytes"),
            );
        } else {
            match self.content.uri.split_once("://") {
                Some((scheme, rest)) if !scheme.is_empty() && !rest.is_empty() => {
                    if !policy.allows(scheme) {
                        failures.push(
                            FailureKind::BadSchemeForKind,
                            "content.uri",
                            format!("scheme '{scheme}' is not allowed"),
                        );
                    }
                }
                _ => {
                    failures.push(FailureKind::BadUri, "content.uri", "missing URI scheme");
                }
            }
        }

        if self.content.sha256.is_empty() {
            failures.push(FailureKind::Empty, "content.sha256", "content.sha256 is required");
        } else if !chartly_canonical::is_hex64(&self.content.sha256) {
            failures.push(
                FailureKind::BadHash,
                "content.sha256",
                "must be a 64-character lowercase hex digest",
            );
        }

        if self.related.len() > MAX_RELATED {
            failures.push(
                FailureKind::TooMany,
                "related",
                format!("{} entries exceed the {MAX_RELATED} cap", self.related.len()),
            );
        }
        for (i, entity) in self.related.iter().enumerate() {
            entity.check(&format!("related[{i}]"), &self.tenant, &mut failures);
        }

        if let Some(subject) = &self.subject {
            subject.check("subject", &self.tenant, &mut failures);
        }

        check_string_map(&self.attributes, "attributes", MAX_ATTRIBUTES, &mut failures);
        check_hex_field(self.prev_hash.as_deref(), "prev_hash", &mut failures);
        check_hex_field(self.hash.as_deref(), "hash", &mut failures);

        failures.finish()
    }
}

impl Envelope for ArtifactEnvelope {
    fn normalize(&mut self) {
        self.tenant = self.tenant.trim().to_lowercase();
        self.kind = self.kind.trim().to_lowercase();
        self.observed = self.observed.with_timezone(&Utc);
        self.event_id = self.event_id.take().map(|e| e.trim().to_string()).filter(|e| !e.is_empty());
        self.content.uri = self.content.uri.trim().to_string();
        self.content.sha256 = self.content.sha256.trim().to_lowercase();
        self.content.content_type = self
            .content
            .content_type
            .take()
            .map(|c| c.trim().to_lowercase())
            .filter(|c| !c.is_empty());
        if let Some(subject) = &mut self.subject {
            subject.normalize();
        }
        for entity in &mut self.related {
            entity.normalize();
        }
        self.related.sort();
        clean_string_map(&mut self.attributes);
        self.prev_hash = self.prev_hash.take().map(|h| h.trim().to_lowercase());
        self.hash = self.hash.take().map(|h| h.trim().to_lowercase());
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        self.validate_with(&UriPolicy::default())
    }

    fn identity_bytes(&self) -> Vec<u8> {
        let subject = self
            .subject
            .as_ref()
            .map(|s| format!("{}/{}/{}", s.tenant, s.kind, s.id))
            .unwrap_or_default();
        format!(
            "{}|{}|{}|{}|{subject}",
            self.tenant,
            self.kind,
            self.content.sha256,
            self.content.content_type.as_deref().unwrap_or_default()
        )
        .into_bytes()
    }

    fn content_hash(&self) -> Option<String> {
        Some(self.content.sha256.clone())
    }

    fn metadata_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        let v = metadata_value(self, &[("observed", self.observed)])?;
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
