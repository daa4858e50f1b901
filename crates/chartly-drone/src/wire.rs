// SPDX-License-Identifier: MIT OR Apache-2.0

//! Wire types for the drone ↔ control-plane HTTP contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `POST /api/drones/register` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Registering drone's identity.
    pub id: String,
}

/// `POST /api/drones/register` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Echoed drone identity.
    pub id: String,
    /// Registration status (informational).
    #[serde(default)]
    pub status: String,
    /// Profile ids this drone is responsible for, in stable order.
    #[serde(default)]
    pub assigned_profiles: Vec<String>,
}

/// `GET /api/drones/<id>/work` response: the forced-run queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkResponse {
    /// Echoed drone identity.
    #[serde(default)]
    pub drone_id: String,
    /// Profile ids with a pending forced run.
    #[serde(default)]
    pub profiles: Vec<String>,
}

/// `GET /api/profiles/<id>` response: the profile envelope.
///
/// `interval` and `jitter` here always take precedence over any schedule
/// embedded in the YAML `content`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileEnvelope {
    /// Profile identifier.
    pub id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Version string.
    #[serde(default)]
    pub version: String,
    /// YAML body executed by the pipeline.
    pub content: String,
    /// Whether the profile may run on schedule (forced runs bypass this).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Interval between runs (duration string).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Jitter window (duration string).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<String>,
    /// Per-run limits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<chartly_pipeline::LimitsSpec>,
}

/// `POST /api/results` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsRequest {
    /// Reporting drone.
    pub drone_id: String,
    /// Executed profile.
    pub profile_id: String,
    /// Run correlation id.
    pub run_id: String,
    /// Pipeline output records.
    pub data: Vec<Value>,
}

/// Outcome classification for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Pipeline and delivery both succeeded.
    Succeeded,
    /// Pipeline succeeded but result delivery failed.
    Partial,
    /// Pipeline (or an earlier stage) failed.
    Failed,
}

/// `POST /api/runs` request: one record per attempted execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Run identifier.
    pub run_id: String,
    /// Executing drone.
    pub drone_id: String,
    /// Executed profile.
    pub profile_id: String,
    /// Execution start (UTC).
    pub started_at: DateTime<Utc>,
    /// Execution finish (UTC).
    pub finished_at: DateTime<Utc>,
    /// Outcome.
    pub status: RunStatus,
    /// Records produced (also reported on `partial`).
    pub rows_out: u64,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Failure detail, truncated to 2048 bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Run {
    /// Build a run record, deriving `duration_ms` (clamped at zero).
    #[must_use]
    pub fn new(
        run_id: String,
        drone_id: String,
        profile_id: String,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        status: RunStatus,
        rows_out: u64,
        error: Option<String>,
    ) -> Self {
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            run_id,
            drone_id,
            profile_id,
            started_at,
            finished_at,
            status,
            rows_out,
            duration_ms,
            error: error.map(|e| crate::truncate_error(&e)),
        }
    }
}

/// `POST /api/drones/heartbeat` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Reporting drone's identity.
    pub id: String,
}
