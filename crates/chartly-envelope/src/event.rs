// SPDX-License-Identifier: MIT OR Apache-2.0

//! Event envelopes: discrete occurrences observed about an entity.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::{
    EntityRef, Envelope, EnvelopeError, FailureKind, Failures, MAX_ATTRIBUTES, MAX_KEY_LEN,
    MAX_NAME_LEN, MAX_TENANT_LEN, canonical_metadata_bytes, check_hex_field, is_identifier,
    metadata_value,
};

/// A discrete occurrence observed for a tenant.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EventEnvelope {
    /// Owning tenant.
    pub tenant: String,
    /// Event name (lowercase identifier, e.g. `"source.paused"`).
    pub name: String,
    /// Observation time (UTC).
    pub observed: DateTime<Utc>,

    /// Entity the event is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<EntityRef>,
    /// Caller-provided identifier for dedupe/correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    /// Bounded free-form attributes (keys normalized).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, Value>,

    /// Hash of the predecessor envelope in the chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    /// Hash of this envelope's canonical metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl EventEnvelope {
    /// Create a minimal event.
    #[must_use]
    pub fn new(
        tenant: impl Into<String>,
        name: impl Into<String>,
        observed: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            name: name.into(),
            observed,
            subject: None,
            event_id: None,
            attributes: BTreeMap::new(),
            prev_hash: None,
            hash: None,
        }
    }
}

impl Envelope for EventEnvelope {
    fn normalize(&mut self) {
        self.tenant = self.tenant.trim().to_lowercase();
        self.name = self.name.trim().to_lowercase();
        self.observed = self.observed.with_timezone(&Utc);
        self.event_id = self.event_id.take().map(|e| e.trim().to_string()).filter(|e| !e.is_empty());
        if let Some(subject) = &mut self.subject {
            subject.normalize();
        }
        let attributes = std::mem::take(&mut self.attributes);
        for (k, v) in attributes {
            let key = k.trim().to_lowercase();
            if key.is_empty() || key.len() > MAX_KEY_LEN {
                continue;
            }
            self.attributes.insert(key, v);
        }
        self.prev_hash = self.prev_hash.take().map(|h| h.trim().to_lowercase());
        self.hash = self.hash.take().map(|h| h.trim().to_lowercase());
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        let mut failures = Failures::default();

        if self.tenant.is_empty() {
            failures.push(FailureKind::Empty, "tenant", "tenant is required");
        } else if !is_identifier(&self.tenant) || self.tenant.len() > MAX_TENANT_LEN {
            failures.push(FailureKind::Invalid, "tenant", "must be a bounded lowercase identifier");
        }

        if self.name.is_empty() {
            failures.push(FailureKind::Empty, "name", "name is required");
        } else if !is_identifier(&self.name) || self.name.len() > MAX_NAME_LEN {
            failures.push(FailureKind::Invalid, "name", "must be a bounded lowercase identifier");
        }

        if self.attributes.len() > MAX_ATTRIBUTES {
            failures.push(
                FailureKind::TooMany,
                "attributes",
                format!("{} entries exceed the {MAX_ATTRIBUTES} cap", self.attributes.len()),
            );
        }
        for k in self.attributes.keys() {
            if !is_identifier(k) {
                failures.push(
                    FailureKind::Invalid,
                    "attributes",
                    format!("key '{k}' is not an identifier"),
                );
            }
        }

        if let Some(subject) = &self.subject {
            subject.check("subject", &self.tenant, &mut failures);
        }

        check_hex_field(self.prev_hash.as_deref(), "prev_hash", &mut failures);
        check_hex_field(self.hash.as_deref(), "hash", &mut failures);

        failures.finish()
    }

    fn identity_bytes(&self) -> Vec<u8> {
        format!(
            "{}|event|{}|{}|{}",
            self.tenant,
            self.name,
            self.observed.timestamp_nanos_opt().unwrap_or_default(),
            self.event_id.as_deref().unwrap_or_default()
        )
        .into_bytes()
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
