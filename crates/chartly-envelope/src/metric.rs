// SPDX-License-Identifier: MIT OR Apache-2.0

//! Metric envelopes: scalar, histogram, and summary observations.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{
    EntityRef, Envelope, EnvelopeError, FailureKind, Failures, MAX_LABELS, MAX_NAME_LEN,
    MAX_TENANT_LEN, canonical_metadata_bytes, check_hex_field, check_string_map, clean_string_map,
    is_identifier, metadata_value,
};

/// Metric types carried on the wire.
const METRIC_TYPES: &[&str] = &["gauge", "counter", "histogram", "summary"];

/// One cumulative histogram bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct HistogramBucket {
    /// Inclusive upper bound of the bucket.
    pub le: f64,
    /// Cumulative count of observations at or below `le`.
    pub count: u64,
}

/// One summary quantile estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SummaryQuantile {
    /// Quantile rank in `[0, 1]`.
    pub q: f64,
    /// Estimated value at the quantile.
    pub value: f64,
}

/// A single metric observation for a tenant.
///
/// Exactly one of `scalar`, `histogram`, or `summary` must be populated,
/// matching the metric type.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MetricEnvelope {
    /// Owning tenant.
    pub tenant: String,
    /// Metric name (lowercase identifier).
    pub name: String,
    /// Metric type: `gauge`, `counter`, `histogram`, or `summary`.
    #[serde(rename = "type")]
    pub metric_type: String,
    /// Observation time (UTC).
    pub observed: DateTime<Utc>,

    /// Entity the observation is about.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<EntityRef>,
    /// Correlating event identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    /// Scalar value for gauge/counter metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalar: Option<f64>,
    /// Cumulative buckets for histogram metrics, ascending by `le`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub histogram: Option<Vec<HistogramBucket>>,
    /// Quantile estimates for summary metrics, ascending by `q`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Vec<SummaryQuantile>>,

    /// Unit of measure (informational).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Bounded descriptive labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Hash of the predecessor envelope in the chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    /// Hash of this envelope's canonical metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl MetricEnvelope {
    /// Create a gauge metric with a scalar value.
    #[must_use]
    pub fn gauge(
        tenant: impl Into<String>,
        name: impl Into<String>,
        value: f64,
        observed: DateTime<Utc>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            name: name.into(),
            metric_type: "gauge".into(),
            observed,
            subject: None,
            event_id: None,
            scalar: Some(value),
            histogram: None,
            summary: None,
            unit: None,
            labels: BTreeMap::new(),
            prev_hash: None,
            hash: None,
        }
    }

    /// Create a counter metric with a scalar value.
    #[must_use]
    pub fn counter(
        tenant: impl Into<String>,
        name: impl Into<String>,
        value: f64,
        observed: DateTime<Utc>,
    ) -> Self {
        let mut m = Self::gauge(tenant, name, value, observed);
        m.metric_type = "counter".into();
        m
    }

    /// Partition key for storage: tenant, name, and the UTC day of the
    /// observation.
    #[must_use]
    pub fn partition_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.tenant,
            self.name,
            self.observed.format("%Y-%m-%d")
        )
    }
}

impl Envelope for MetricEnvelope {
    fn normalize(&mut self) {
        self.tenant = self.tenant.trim().to_lowercase();
        self.name = self.name.trim().to_lowercase();
        self.metric_type = self.metric_type.trim().to_lowercase();
        self.event_id = self.event_id.take().map(|e| e.trim().to_string()).filter(|e| !e.is_empty());
        self.unit = self.unit.take().map(|u| u.trim().to_string()).filter(|u| !u.is_empty());
        self.observed = self.observed.with_timezone(&Utc);
        if let Some(subject) = &mut self.subject {
            subject.normalize();
        }
        if let Some(buckets) = &mut self.histogram {
            buckets.sort_by(|a, b| a.le.total_cmp(&b.le));
        }
        if let Some(quantiles) = &mut self.summary {
            quantiles.sort_by(|a, b| a.q.total_cmp(&b.q));
        }
        clean_string_map(&mut self.labels);
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

        if !METRIC_TYPES.contains(&self.metric_type.as_str()) {
            failures.push(
                FailureKind::Invalid,
                "type",
                "must be one of: gauge, counter, histogram, summary",
            );
        }

        let populated = usize::from(self.scalar.is_some())
            + usize::from(self.histogram.is_some())
            + usize::from(self.summary.is_some());
        if populated != 1 {
            failures.push(
                FailureKind::Invalid,
                "value",
                "exactly one of scalar, histogram, summary must be set",
            );
        }

        match self.metric_type.as_str() {
            "gauge" | "counter" if self.scalar.is_none() => {
                failures.push(
                    FailureKind::Invalid,
                    "scalar",
                    "invalid_metric: gauge/counter require scalar only",
                );
            }
            "histogram" if self.histogram.is_none() => {
                failures.push(FailureKind::Invalid, "histogram", "histogram metrics require buckets");
            }
            "summary" if self.summary.is_none() => {
                failures.push(FailureKind::Invalid, "summary", "summary metrics require quantiles");
            }
            _ => {}
        }

        if self.metric_type == "counter"
            && let Some(v) = self.scalar
            && v < 0.0
        {
            failures.push(
                FailureKind::Invalid,
                "scalar",
                "invalid_metric: counter values must be non-negative",
            );
        }

        if let Some(v) = self.scalar
            && !v.is_finite()
        {
            failures.push(FailureKind::Invalid, "scalar", "must be finite");
        }

        if let Some(buckets) = &self.histogram {
            if buckets.is_empty() {
                failures.push(FailureKind::Empty, "histogram", "buckets must not be empty");
            }
            for pair in buckets.windows(2) {
                if pair[1].le < pair[0].le {
                    failures.push(FailureKind::Invalid, "histogram", "bucket le must be non-decreasing");
                    break;
                }
            }
            for pair in buckets.windows(2) {
                if pair[1].count < pair[0].count {
                    failures.push(
                        FailureKind::Invalid,
                        "histogram",
                        "counts must be non-decreasing",
                    );
                    break;
                }
            }
        }

        if let Some(quantiles) = &self.summary {
            if quantiles.is_empty() {
                failures.push(FailureKind::Empty, "summary", "quantiles must not be empty");
            }
            for q in quantiles {
                if !(0.0..=1.0).contains(&q.q) {
                    failures.push(FailureKind::Invalid, "summary", "quantile rank outside [0, 1]");
                    break;
                }
            }
            for pair in quantiles.windows(2) {
                if pair[1].q <= pair[0].q {
                    failures.push(
                        FailureKind::Invalid,
                        "summary",
                        "quantiles must be sorted and unique",
                    );
                    break;
                }
            }
        }

        if let Some(subject) = &self.subject {
            subject.check("subject", &self.tenant, &mut failures);
        }

        check_string_map(&self.labels, "labels", MAX_LABELS, &mut failures);
        check_hex_field(self.prev_hash.as_deref(), "prev_hash", &mut failures);
        check_hex_field(self.hash.as_deref(), "hash", &mut failures);

        failures.finish()
    }

    fn identity_bytes(&self) -> Vec<u8> {
        let subject = self
            .subject
            .as_ref()
            .map(|s| format!("{}/{}/{}", s.tenant, s.kind, s.id))
            .unwrap_or_default();
        format!(
            "{}|metric|{}|{}|{subject}",
            self.tenant,
            self.name,
            self.observed.timestamp_nanos_opt().unwrap_or_default()
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
