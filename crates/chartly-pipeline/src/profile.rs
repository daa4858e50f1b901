// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed profile content: the YAML document a drone executes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Errors from decoding profile content.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// The content is not valid YAML for the profile shape.
    #[error("invalid_profile_yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The source type is not one the pipeline can execute.
    #[error("unsupported source type '{0}'")]
    UnsupportedSource(String),
}

/// Where and how to fetch the raw payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Source mechanism; only `http_rest` is executable.
    #[serde(rename = "type")]
    pub source_type: String,
    /// Fetch URL; may contain `${VAR}` environment placeholders.
    pub url: String,
    /// Authentication mode (informational; `none` today).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

/// Scheduling hints embedded in profile content.
///
/// These are informational: the envelope's own `interval`/`jitter` fields
/// always take precedence in the drone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    /// Whether the profile wants periodic execution.
    pub enabled: bool,
    /// Interval between runs (humantime string, e.g. `"5m"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Jitter window (humantime string).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<String>,
}

/// Per-run execution limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsSpec {
    /// Maximum records produced per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_records: Option<u64>,
    /// Maximum pages fetched per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pages: Option<u64>,
    /// Maximum bytes fetched per run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u64>,
}

/// The decoded YAML body of a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileContent {
    /// Profile identifier.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Content version string.
    pub version: String,
    /// Fetch specification.
    pub source: SourceSpec,
    /// Source-path to destination-path mapping.
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
    /// Informational scheduling hints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleSpec>,
    /// Per-run limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<LimitsSpec>,
}

impl ProfileContent {
    /// Decode profile content from its YAML body.
    ///
    /// # Errors
    ///
    /// Returns [`ProfileError::Yaml`] for malformed documents and
    /// [`ProfileError::UnsupportedSource`] for source types the pipeline
    /// cannot execute.
    pub fn from_yaml(content: &str) -> Result<Self, ProfileError> {
        let parsed: Self = serde_yaml::from_str(content)?;
        if parsed.source.source_type != "http_rest" {
            return Err(ProfileError::UnsupportedSource(
                parsed.source.source_type.clone(),
            ));
        }
        Ok(parsed)
    }
}
